//! `XChaCha20-Poly1305` frame sealing.
//!
//! Every transport frame is sealed independently with a fresh random
//! 192-bit nonce, so no counter state has to be shared between peers.
//!
//! ```text
//! +----------------+---------------------------+-----------+
//! | nonce (24)     | ciphertext (len)          | tag (16)  |
//! +----------------+---------------------------+-----------+
//! ```

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::random::random_array;
use crate::{CryptoError, SEAL_OVERHEAD, XCHACHA_KEY_SIZE, XCHACHA_NONCE_SIZE};

/// Symmetric key used to seal and open transport frames.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FrameKey([u8; XCHACHA_KEY_SIZE]);

impl FrameKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; XCHACHA_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; XCHACHA_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: XCHACHA_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(key))
    }

    /// Generate a random key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_array()?))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; XCHACHA_KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Seal `plaintext`, binding `aad`. Output is `nonce || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if nonce generation or encryption fails.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce: [u8; XCHACHA_NONCE_SIZE] = random_array()?;
        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(XCHACHA_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a frame produced by [`FrameKey::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::FrameTooShort`] for truncated input and
    /// [`CryptoError::DecryptionFailed`] if authentication fails.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::FrameTooShort(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(XCHACHA_NONCE_SIZE);
        self.cipher()
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for FrameKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameKey").finish_non_exhaustive()
    }
}
