//! # Starling Crypto
//!
//! Cryptographic primitives for the Starling mesh.
//!
//! This crate provides:
//! - Pre-shared key derivation from an operator passphrase
//! - `XChaCha20-Poly1305` sealing of transport frames
//! - Secure random bytes for identifiers and nonces
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | KDF | BLAKE3 `derive_key` | 128-bit |
//! | Fingerprint | BLAKE3 keyed hash | 128-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod random;

pub use aead::FrameKey;
pub use error::CryptoError;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Bytes added to every sealed frame (nonce + tag)
pub const SEAL_OVERHEAD: usize = XCHACHA_NONCE_SIZE + TAG_SIZE;
