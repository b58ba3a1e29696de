//! Keyed one-way hashing of plaintext API keys.
//!
//! Keys are only ever stored and looked up as HMAC-SHA256 digests over a
//! server-held secret. Verification is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::ConfigError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct KeyHasher {
    mac: HmacSha256,
}

impl std::fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHasher")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl KeyHasher {
    /// The secret comes from process configuration and must be present; an
    /// empty secret is a startup failure, never a silent default.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, ConfigError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(ConfigError::MissingHashSecret);
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|err| ConfigError::InvalidHashSecret(err.to_string()))?;
        Ok(Self { mac })
    }

    /// Deterministic digest of `plaintext`, lowercase hex.
    pub fn hash(&self, plaintext: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(plaintext.as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }

    /// Recomputes the digest and compares in constant time. Malformed or
    /// wrong-length digests are `false`, never an error.
    pub fn verify(&self, plaintext: &str, digest_hex: &str) -> bool {
        let Some(digest) = hex_decode(digest_hex) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(plaintext.as_bytes());
        mac.verify_slice(&digest).is_ok()
    }
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(raw.len() / 2);
    let bytes = raw.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}
