//! Swarm message codec
//!
//! Wire format (network byte order):
//! [magic: u16][type: u16][flags: u16][key epoch: u16][sequence: u32][length: u32][payload]
//!
//! When crypto is enabled the payload is sealed with the active swarm
//! key and the encrypted flag is set; `Nenc` messages stay plaintext
//! unconditionally.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use swarmlink_crypto::{CryptoError, KeySchedule};

use crate::error::{NetError, NetResult};
use crate::{MAGIC, MAX_DATAGRAM_SIZE};

/// Payload is sealed with the swarm key
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// Payload is one fragment of a larger message
pub const FLAG_FRAGMENT: u16 = 0x0002;
/// Final fragment of its sequence
pub const FLAG_FINAL_FRAGMENT: u16 = 0x0004;

/// Fixed header size
pub const HEADER_SIZE: usize = 16;

/// Fragment payloads carry `index: u16, total: u16` before the chunk
const FRAGMENT_PREFIX: usize = 4;

/// Partial messages older than this are discarded
const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Control message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// Explicit plaintext, never encrypted
    Nenc = 0,
    /// Echo/keep-alive probe
    Ping = 1,
    /// Peer-to-peer liveness query/reply
    XpeerPing = 2,
    /// Handshake introduction record
    Intro = 3,
    /// Request for an introduction
    IntroReq = 4,
    /// Relay-wrapped message or relay probe
    Proxy = 5,
    /// Latency measurement request/reply
    Latency = 6,
    /// Link-layer payload or overlay coordination
    Comm = 7,
}

impl TryFrom<u16> for MsgType {
    type Error = NetError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Nenc),
            1 => Ok(Self::Ping),
            2 => Ok(Self::XpeerPing),
            3 => Ok(Self::Intro),
            4 => Ok(Self::IntroReq),
            5 => Ok(Self::Proxy),
            6 => Ok(Self::Latency),
            7 => Ok(Self::Comm),
            other => Err(NetError::Framing(format!("unknown message type {other}"))),
        }
    }
}

/// A swarm message in memory
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MsgType,
    pub flags: u16,
    pub key_epoch: u16,
    pub sequence: u32,
    pub payload: Bytes,
}

impl Message {
    /// Create a message with empty flags
    pub fn new(msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            flags: 0,
            key_epoch: 0,
            sequence: 0,
            payload: payload.into(),
        }
    }

    /// Whether the encrypted flag is set
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Whether this is a fragment
    pub fn is_fragment(&self) -> bool {
        self.flags & FLAG_FRAGMENT != 0
    }

    /// Encode to wire bytes. With an enabled schedule the payload is
    /// sealed unless the type is `Nenc`.
    pub fn encode(&self, sequence: u32, schedule: &KeySchedule) -> NetResult<Bytes> {
        let (flags, epoch, payload) = if schedule.is_enabled() && self.msg_type != MsgType::Nenc {
            let (epoch, sealed) = schedule.seal(&self.payload)?;
            (self.flags | FLAG_ENCRYPTED, epoch, Bytes::from(sealed))
        } else {
            (self.flags & !FLAG_ENCRYPTED, 0, self.payload.clone())
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u16(MAGIC);
        buf.put_u16(self.msg_type as u16);
        buf.put_u16(flags);
        buf.put_u16(epoch);
        buf.put_u32(sequence);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Parse a datagram header. The payload stays as received; call
    /// [`Message::open`] to remove encryption.
    pub fn decode(mut bytes: Bytes) -> NetResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(NetError::Framing(format!(
                "datagram too short: {} bytes",
                bytes.len()
            )));
        }
        let magic = bytes.get_u16();
        if magic != MAGIC {
            return Err(NetError::Framing(format!("bad magic 0x{magic:04x}")));
        }
        let msg_type = MsgType::try_from(bytes.get_u16())?;
        let flags = bytes.get_u16();
        let key_epoch = bytes.get_u16();
        let sequence = bytes.get_u32();
        let length = bytes.get_u32() as usize;
        if length != bytes.len() || length > MAX_DATAGRAM_SIZE {
            return Err(NetError::Framing(format!(
                "length field {length} does not match payload {}",
                bytes.len()
            )));
        }
        Ok(Self {
            msg_type,
            flags,
            key_epoch,
            sequence,
            payload: bytes,
        })
    }

    /// Remove encryption from a received message. Unknown epochs and
    /// failed authentication surface as framing errors so the caller
    /// drops the datagram and continues.
    pub fn open(self, schedule: &KeySchedule) -> NetResult<Self> {
        if !self.is_encrypted() {
            return Ok(self);
        }
        let payload = schedule
            .open(self.key_epoch, &self.payload)
            .map_err(|e| match e {
                CryptoError::UnknownEpoch(epoch) => {
                    NetError::Framing(format!("datagram sealed with unknown epoch {epoch}"))
                }
                other => NetError::Framing(format!("datagram rejected: {other}")),
            })?;
        Ok(Self {
            flags: self.flags & !FLAG_ENCRYPTED,
            payload: Bytes::from(payload),
            ..self
        })
    }
}

/// Splits oversized payloads into fragment messages
#[derive(Debug, Default)]
pub struct Fragmenter;

impl Fragmenter {
    /// Split `payload` into fragments that fit `max_payload` bytes
    /// each. Returns a single unflagged message when it already fits.
    pub fn split(msg_type: MsgType, payload: Bytes, max_payload: usize) -> Vec<Message> {
        if payload.len() <= max_payload {
            return vec![Message::new(msg_type, payload)];
        }
        let chunk = max_payload.saturating_sub(FRAGMENT_PREFIX).max(1);
        let total = payload.len().div_ceil(chunk);
        let mut out = Vec::with_capacity(total);
        for (index, offset) in (0..payload.len()).step_by(chunk).enumerate() {
            let end = (offset + chunk).min(payload.len());
            let mut buf = BytesMut::with_capacity(FRAGMENT_PREFIX + end - offset);
            buf.put_u16(index as u16);
            buf.put_u16(total as u16);
            buf.put_slice(&payload[offset..end]);
            let mut msg = Message::new(msg_type, buf.freeze());
            msg.flags |= FLAG_FRAGMENT;
            if index + 1 == total {
                msg.flags |= FLAG_FINAL_FRAGMENT;
            }
            out.push(msg);
        }
        out
    }
}

struct PartialMessage {
    chunks: HashMap<u16, Bytes>,
    total: u16,
    started: Instant,
}

/// Reassembles fragments keyed by `(sender, sequence)`
#[derive(Default)]
pub struct Reassembler {
    partial: HashMap<(SocketAddr, u32), PartialMessage>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one message. Non-fragments pass through; a completed
    /// sequence returns the stitched message, otherwise `None`.
    pub fn accept(&mut self, from: SocketAddr, msg: Message) -> NetResult<Option<Message>> {
        if !msg.is_fragment() {
            return Ok(Some(msg));
        }
        let mut payload = msg.payload.clone();
        if payload.len() < FRAGMENT_PREFIX {
            return Err(NetError::Framing("fragment too short".into()));
        }
        let index = payload.get_u16();
        let total = payload.get_u16();
        if total == 0 || index >= total {
            return Err(NetError::Framing(format!(
                "fragment index {index} out of range (total {total})"
            )));
        }

        self.expire();

        let key = (from, msg.sequence);
        let entry = self.partial.entry(key).or_insert_with(|| PartialMessage {
            chunks: HashMap::new(),
            total,
            started: Instant::now(),
        });
        if entry.total != total {
            return Err(NetError::Framing("fragment total mismatch".into()));
        }
        entry.chunks.insert(index, payload);

        if entry.chunks.len() == entry.total as usize {
            let entry = self.partial.remove(&key).expect("entry present");
            let mut buf = BytesMut::new();
            for i in 0..entry.total {
                let chunk = entry
                    .chunks
                    .get(&i)
                    .ok_or_else(|| NetError::Framing("missing fragment".into()))?;
                buf.put_slice(chunk);
            }
            return Ok(Some(Message {
                flags: msg.flags & !(FLAG_FRAGMENT | FLAG_FINAL_FRAGMENT),
                payload: buf.freeze(),
                ..msg
            }));
        }
        Ok(None)
    }

    fn expire(&mut self) {
        self.partial
            .retain(|_, p| p.started.elapsed() < REASSEMBLY_TIMEOUT);
    }

    /// Number of partially reassembled messages held
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
