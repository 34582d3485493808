//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Sealed frame shorter than nonce + tag
    #[error("sealed frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Passphrase was empty
    #[error("pre-shared passphrase must not be empty")]
    EmptyPassphrase,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
