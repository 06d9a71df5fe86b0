//! Epoch-tagged key schedule
//!
//! Keys come from a keyfile (one `base64(material) ttl` record per
//! line) or from a literal key string handed over at startup. A
//! literal key overrides the keyfile as the active key but the loaded
//! keys stay in the schedule so older epochs keep decrypting.

use std::fmt;
use std::path::Path;

use base64::prelude::*;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::{DEFAULT_KEY_TTL_SECS, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// One shared swarm key with its validity horizon
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SwarmKey {
    material: [u8; KEY_SIZE],
    #[zeroize(skip)]
    valid_until: DateTime<Utc>,
    #[zeroize(skip)]
    epoch: u16,
}

impl SwarmKey {
    /// Build a key from raw material
    pub fn new(material: [u8; KEY_SIZE], valid_until: DateTime<Utc>, epoch: u16) -> Self {
        Self {
            material,
            valid_until,
            epoch,
        }
    }

    /// Normalize an arbitrary-length secret string into key material.
    /// Shorter inputs are zero-padded, longer ones truncated.
    pub fn from_secret(secret: &str, valid_until: DateTime<Utc>, epoch: u16) -> Self {
        let mut material = [0u8; KEY_SIZE];
        let bytes = secret.as_bytes();
        let n = bytes.len().min(KEY_SIZE);
        material[..n].copy_from_slice(&bytes[..n]);
        Self {
            material,
            valid_until,
            epoch,
        }
    }

    /// Generate a random key
    pub fn generate(valid_until: DateTime<Utc>, epoch: u16) -> Self {
        let mut material = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut material);
        Self {
            material,
            valid_until,
            epoch,
        }
    }

    /// Key epoch carried in message headers
    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    /// Whether this key may still be used
    pub fn is_valid(&self) -> bool {
        self.valid_until >= Utc::now()
    }

    /// Expiry instant
    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }
}

impl fmt::Debug for SwarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmKey")
            .field("epoch", &self.epoch)
            .field("valid_until", &self.valid_until)
            .finish_non_exhaustive()
    }
}

/// Ordered list of swarm keys with one active epoch
#[derive(Debug, Default)]
pub struct KeySchedule {
    keys: Vec<SwarmKey>,
    active: Option<u16>,
}

impl KeySchedule {
    /// Empty schedule; encryption stays disabled until a key arrives
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `base64(material) ttl` records from a keyfile. The first
    /// key of the file becomes active.
    pub fn load_keyfile(path: &Path) -> CryptoResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::MalformedKeyfile(format!("{}: {e}", path.display())))?;
        let mut schedule = Self::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let material = fields
                .next()
                .ok_or_else(|| CryptoError::MalformedKeyfile(format!("line {}", lineno + 1)))?;
            let ttl = fields.next().unwrap_or("default");
            let decoded = BASE64_STANDARD.decode(material).map_err(|e| {
                CryptoError::MalformedKeyfile(format!("line {}: {e}", lineno + 1))
            })?;
            if decoded.len() != KEY_SIZE {
                return Err(CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: decoded.len(),
                });
            }
            let mut material = [0u8; KEY_SIZE];
            material.copy_from_slice(&decoded);
            let valid_until = Utc::now() + parse_ttl(ttl)?;
            let epoch = schedule.next_epoch();
            schedule.keys.push(SwarmKey::new(material, valid_until, epoch));
        }
        if let Some(first) = schedule.keys.first() {
            schedule.active = Some(first.epoch());
        }
        debug!(keys = schedule.keys.len(), "loaded keyfile");
        Ok(schedule)
    }

    /// Append a literal key and make it active. An empty ttl means
    /// "default".
    pub fn add_literal(&mut self, secret: &str, ttl: &str) -> CryptoResult<u16> {
        let ttl = if ttl.is_empty() { "default" } else { ttl };
        let valid_until = Utc::now() + parse_ttl(ttl)?;
        let epoch = self.next_epoch();
        self.keys.push(SwarmKey::from_secret(secret, valid_until, epoch));
        self.active = Some(epoch);
        debug!(epoch, "activated literal key");
        Ok(epoch)
    }

    /// Append an already-built key and make it active
    pub fn activate(&mut self, key: SwarmKey) {
        self.active = Some(key.epoch());
        self.keys.push(key);
    }

    /// Whether encryption is enabled at all
    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// The currently active key; fails when none is valid
    pub fn active_key(&self) -> CryptoResult<&SwarmKey> {
        let epoch = self.active.ok_or(CryptoError::NoValidKey)?;
        let key = self
            .keys
            .iter()
            .find(|k| k.epoch() == epoch)
            .ok_or(CryptoError::NoValidKey)?;
        if !key.is_valid() {
            return Err(CryptoError::NoValidKey);
        }
        Ok(key)
    }

    /// Look up the key for a datagram's epoch tag
    pub fn key_for_epoch(&self, epoch: u16) -> CryptoResult<&SwarmKey> {
        self.keys
            .iter()
            .find(|k| k.epoch() == epoch)
            .ok_or(CryptoError::UnknownEpoch(epoch))
    }

    /// Seal a payload with the active key. Returns the epoch used and
    /// `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<(u16, Vec<u8>)> {
        let key = self.active_key()?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key.material)
            .map_err(|e| CryptoError::EncryptFailed(e.to_string()))?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptFailed("aead failure".into()))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok((key.epoch(), out))
    }

    /// Open `nonce || ciphertext || tag` sealed under `epoch`
    pub fn open(&self, epoch: u16, data: &[u8]) -> CryptoResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort(data.len()));
        }
        let key = self.key_for_epoch(epoch)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key.material)
            .map_err(|_| CryptoError::DecryptFailed)?;
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    fn next_epoch(&self) -> u16 {
        self.keys.iter().map(|k| k.epoch()).max().map_or(0, |e| e + 1)
    }
}

/// Parse a ttl string: "default", bare seconds, or seconds with an
/// "s" suffix.
fn parse_ttl(ttl: &str) -> CryptoResult<Duration> {
    if ttl == "default" {
        return Ok(Duration::seconds(DEFAULT_KEY_TTL_SECS));
    }
    let digits = ttl.strip_suffix('s').unwrap_or(ttl);
    let secs: i64 = digits
        .parse()
        .map_err(|_| CryptoError::MalformedKeyfile(format!("bad ttl: {ttl}")))?;
    if secs <= 0 {
        return Err(CryptoError::MalformedKeyfile(format!("bad ttl: {ttl}")));
    }
    Ok(Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule_with_one_key() -> KeySchedule {
        let mut s = KeySchedule::new();
        s.add_literal("swarm secret", "60s").unwrap();
        s
    }

    #[test]
    fn seal_open_roundtrip() {
        let s = schedule_with_one_key();
        let (epoch, sealed) = s.seal(b"frame bytes").unwrap();
        assert_ne!(sealed.as_slice(), b"frame bytes");
        let opened = s.open(epoch, &sealed).unwrap();
        assert_eq!(opened, b"frame bytes");
    }

    #[test]
    fn unknown_epoch_is_rejected() {
        let s = schedule_with_one_key();
        let (_, sealed) = s.seal(b"payload").unwrap();
        let err = s.open(42, &sealed).unwrap_err();
        assert!(matches!(err, CryptoError::UnknownEpoch(42)));
    }

    #[test]
    fn rotation_bumps_epoch_and_keeps_old_keys() {
        let mut s = schedule_with_one_key();
        let (first_epoch, sealed_old) = s.seal(b"old").unwrap();
        s.add_literal("fresh secret", "60s").unwrap();
        let (second_epoch, _) = s.seal(b"new").unwrap();
        assert_eq!(second_epoch, first_epoch + 1);
        // Old epoch still decrypts after rotation
        assert_eq!(s.open(first_epoch, &sealed_old).unwrap(), b"old");
    }

    #[test]
    fn expired_key_disables_sends() {
        let mut s = KeySchedule::new();
        let expired = SwarmKey::from_secret("stale", Utc::now() - Duration::seconds(1), 0);
        s.activate(expired);
        assert!(matches!(s.seal(b"x"), Err(CryptoError::NoValidKey)));
    }

    #[test]
    fn empty_schedule_is_disabled() {
        let s = KeySchedule::new();
        assert!(!s.is_enabled());
        assert!(matches!(s.active_key(), Err(CryptoError::NoValidKey)));
    }

    #[test]
    fn ttl_parsing() {
        assert!(parse_ttl("default").is_ok());
        assert_eq!(parse_ttl("90").unwrap(), Duration::seconds(90));
        assert_eq!(parse_ttl("60s").unwrap(), Duration::seconds(60));
        assert!(parse_ttl("soon").is_err());
        assert!(parse_ttl("-5").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let s = schedule_with_one_key();
        let (epoch, mut sealed) = s.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(s.open(epoch, &sealed), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn keyfile_roundtrip() {
        let dir = std::env::temp_dir().join("swarmlink-keyfile-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keys");
        let material = BASE64_STANDARD.encode([7u8; KEY_SIZE]);
        std::fs::write(&path, format!("# swarm keys\n{material} 120\n{material} default\n"))
            .unwrap();
        let s = KeySchedule::load_keyfile(&path).unwrap();
        assert!(s.is_enabled());
        assert_eq!(s.active_key().unwrap().epoch(), 0);
        assert!(s.key_for_epoch(1).is_ok());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn keyfile_rejects_short_material() {
        let dir = std::env::temp_dir().join("swarmlink-keyfile-test2");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keys");
        std::fs::write(&path, format!("{} 120\n", BASE64_STANDARD.encode([1u8; 8]))).unwrap();
        assert!(matches!(
            KeySchedule::load_keyfile(&path),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
        std::fs::remove_file(&path).ok();
    }
}
