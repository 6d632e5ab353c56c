//! Keyed integrity hash.
//!
//! HMAC-SHA256 over length-prefixed fields, keyed by a subkey of the
//! record's master key version. Each field is prefixed with its length as a
//! big-endian `u64`, so field boundaries cannot be shifted.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::CryptoError;
use super::keys::KeyMaterial;

type HmacSha256 = Hmac<Sha256>;

const INTEGRITY_LABEL: &[u8] = b"tessera/integrity/v1";

/// Incremental integrity MAC.
pub struct IntegrityMac {
    mac: HmacSha256,
}

impl IntegrityMac {
    /// Starts a MAC keyed from `key`.
    pub fn new(key: &KeyMaterial) -> Result<Self, CryptoError> {
        let subkey = key.derive_subkey(INTEGRITY_LABEL)?;
        let mac = <HmacSha256 as Mac>::new_from_slice(subkey.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Appends one length-prefixed field.
    pub fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.mac.update(&(bytes.len() as u64).to_be_bytes());
        self.mac.update(bytes);
        self
    }

    /// Appends an optional field, distinguishing `None` from empty.
    pub fn optional(&mut self, bytes: Option<&[u8]>) -> &mut Self {
        match bytes {
            Some(bytes) => {
                self.mac.update(&[1]);
                self.field(bytes)
            }
            None => {
                self.mac.update(&[0]);
                self
            }
        }
    }

    /// Returns the hex-encoded MAC.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.mac.finalize().into_bytes())
    }

    /// Compares against a hex-encoded MAC in constant time.
    ///
    /// Malformed hex never verifies.
    #[must_use]
    pub fn verify_hex(self, expected: &str) -> bool {
        match hex::decode(expected) {
            Ok(expected) => self.mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac_of(key: &KeyMaterial, fields: &[&[u8]]) -> String {
        let mut mac = IntegrityMac::new(key).unwrap();
        for field in fields {
            mac.field(field);
        }
        mac.finalize_hex()
    }

    #[test]
    fn test_verify_roundtrip() {
        let key = KeyMaterial::generate();
        let hash = mac_of(&key, &[b"st-1", b"access"]);
        assert_eq!(hash.len(), 64);

        let mut mac = IntegrityMac::new(&key).unwrap();
        mac.field(b"st-1").field(b"access");
        assert!(mac.verify_hex(&hash));
    }

    #[test]
    fn test_field_boundaries_matter() {
        let key = KeyMaterial::generate();
        assert_ne!(mac_of(&key, &[b"ab", b"c"]), mac_of(&key, &[b"a", b"bc"]));
    }

    #[test]
    fn test_none_differs_from_empty() {
        let key = KeyMaterial::generate();
        let mut a = IntegrityMac::new(&key).unwrap();
        a.optional(None);
        let mut b = IntegrityMac::new(&key).unwrap();
        b.optional(Some(b""));
        assert_ne!(a.finalize_hex(), b.finalize_hex());
    }

    #[test]
    fn test_wrong_key_or_bad_hex_fails() {
        let key = KeyMaterial::generate();
        let hash = mac_of(&key, &[b"st-1"]);

        let mut mac = IntegrityMac::new(&KeyMaterial::generate()).unwrap();
        mac.field(b"st-1");
        assert!(!mac.verify_hex(&hash));

        let mut mac = IntegrityMac::new(&key).unwrap();
        mac.field(b"st-1");
        assert!(!mac.verify_hex("zz"));
    }
}
