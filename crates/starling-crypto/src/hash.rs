//! BLAKE3 key derivation and fingerprints.

use crate::CryptoError;
use crate::aead::FrameKey;

/// Context string for deriving the mesh frame key.
const FRAME_KEY_CONTEXT: &str = "starling 2024 mesh frame key v1";

/// Derive the frame key shared by every node holding `passphrase`.
///
/// # Errors
///
/// Returns [`CryptoError::EmptyPassphrase`] for an empty passphrase.
pub fn derive_frame_key(passphrase: &[u8]) -> Result<FrameKey, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    Ok(FrameKey::from_bytes(blake3::derive_key(
        FRAME_KEY_CONTEXT,
        passphrase,
    )))
}

/// Short printable fingerprint of a key, safe to log.
#[must_use]
pub fn fingerprint(key: &FrameKey) -> String {
    let digest = blake3::keyed_hash(key.as_bytes(), b"fingerprint");
    digest.as_bytes()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = derive_frame_key(b"correct horse").unwrap();
        let b = derive_frame_key(b"correct horse").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_distinct_passphrases() {
        let a = derive_frame_key(b"one").unwrap();
        let b = derive_frame_key(b"two").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(
            derive_frame_key(b""),
            Err(CryptoError::EmptyPassphrase)
        ));
    }

    #[test]
    fn test_fingerprint_length() {
        let key = derive_frame_key(b"abc").unwrap();
        assert_eq!(fingerprint(&key).len(), 16);
    }
}
