//! Key Hasher Module
//!
//! Maps arbitrary serializable keys to fixed-length, filesystem-safe
//! content addresses: serialize to JSON, hash with SHA-256, encode with
//! base64, then replace any character outside `[A-Za-z0-9-_]` with an
//! alphabet character picked by the character's position. Equal keys always
//! produce the same address, and two different invalid characters at the
//! same position map to the same replacement.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

const SAFE_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Computes the content address for `key`.
///
/// # Errors
/// `Internal` if the key cannot be serialized.
pub fn content_address<K>(key: &K) -> Result<String>
where
    K: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(key)
        .map_err(|err| crate::error::CacheError::Internal(format!("unhashable key: {}", err)))?;
    let digest = Sha256::digest(&bytes);
    let encoded = STANDARD.encode(digest);

    let sanitized: String = encoded
        .bytes()
        .enumerate()
        .map(|(position, byte)| {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                byte as char
            } else {
                SAFE_ALPHABET[position % SAFE_ALPHABET.len()] as char
            }
        })
        .collect();
    Ok(sanitized)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn is_safe(address: &str) -> bool {
        address
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    #[test]
    fn test_equal_keys_equal_addresses() {
        let a = content_address("user:42").unwrap();
        let b = content_address("user:42").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_keys_different_addresses() {
        let a = content_address("user:42").unwrap();
        let b = content_address("user:43").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_address_is_filesystem_safe() {
        for key in ["simple", "with/slashes", "spaces and ünïcode", ""] {
            let address = content_address(key).unwrap();
            assert!(is_safe(&address), "unsafe address for key {:?}", key);
        }
    }

    #[test]
    fn test_address_length_is_fixed() {
        // 32-byte digest, base64 with padding.
        assert_eq!(content_address("a").unwrap().len(), 44);
        assert_eq!(content_address("a much longer key value").unwrap().len(), 44);
    }

    #[test]
    fn test_structured_keys_hash() {
        #[derive(serde::Serialize)]
        struct Lookup {
            tenant: u32,
            name: &'static str,
        }
        let a = content_address(&Lookup { tenant: 1, name: "x" }).unwrap();
        let b = content_address(&Lookup { tenant: 2, name: "x" }).unwrap();
        assert_ne!(a, b);
    }
}
