//! Fixed-width mesh identifiers.
//!
//! Every identifier is an opaque byte array. The all-zero value is a
//! sentinel: for [`NodeId`] it means "broadcast" as a destination and
//! "unset" as a source; for [`ConnectId`] it means "no connection".
//!
//! Identifiers print as uppercase hex split into `sqrt(len)` groups, each
//! type with its own separator:
//!
//! | Type | Bytes | Example |
//! |------|-------|---------|
//! | `NodeId` | 9 | `0A1B2C-3D4E5F-607182` |
//! | `ConnectId` | 9 | `0A1B2C+3D4E5F+607182` |
//! | `StreamId` | 9 | `0A1B2C~3D4E5F~607182` |
//! | `FileId` | 9 | `0A1B2C/3D4E5F/607182` |
//! | `MessageId` | 16 | `0A1B2C3D:...` (4 groups) |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    /// Input contained non-hex characters after removing separators
    #[error("invalid hex in identifier")]
    InvalidHex,

    /// Decoded length does not match the identifier width
    #[error("identifier must be {expected} bytes, got {actual}")]
    WrongLength {
        /// Expected byte length
        expected: usize,
        /// Decoded byte length
        actual: usize,
    },
}

/// Format bytes as uppercase hex split into `sqrt(len)` groups of
/// `sqrt(len)` bytes. Bytes beyond the largest square are not shown.
pub fn sqrted_string(bytes: &[u8], sep: &str) -> String {
    let n = bytes.len().isqrt();
    (0..n)
        .map(|i| hex::encode_upper(&bytes[i * n..i * n + n]))
        .collect::<Vec<_>>()
        .join(sep)
}

macro_rules! mesh_id {
    ($(#[$meta:meta])* $name:ident, $len:expr, $sep:expr) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        pub struct $name([u8; $len]);

        impl $name {
            /// Width in bytes
            pub const LEN: usize = $len;

            /// The all-zero sentinel value
            pub const ZERO: Self = Self([0u8; $len]);

            /// Wrap raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Generate a fresh random identifier that is never the sentinel.
            #[must_use]
            pub fn random() -> Self {
                loop {
                    let id = Self(rand::random());
                    if !id.is_zero() {
                        return id;
                    }
                }
            }

            /// Raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Whether this is the all-zero sentinel.
            #[must_use]
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&sqrted_string(&self.0, $sep))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits: String = s.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
                let bytes = hex::decode(&digits).map_err(|_| IdParseError::InvalidHex)?;
                let actual = bytes.len();
                let bytes: [u8; $len] = bytes.try_into().map_err(|_| IdParseError::WrongLength {
                    expected: $len,
                    actual,
                })?;
                Ok(Self(bytes))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }
    };
}

mesh_id!(
    /// Identifies one node for the lifetime of its process.
    NodeId,
    9,
    "-"
);

mesh_id!(
    /// Identifies one registered connection or listener on the local node.
    ConnectId,
    9,
    "+"
);

mesh_id!(
    /// Identifies one logical message for dedup purposes.
    MessageId,
    16,
    ":"
);

mesh_id!(
    /// Identifies one multiplexed circuit, shared by both endpoints.
    StreamId,
    9,
    "~"
);

mesh_id!(
    /// Identifies one file transfer.
    FileId,
    9,
    "/"
);

impl NodeId {
    /// Destination meaning "every reachable node"
    pub const BROADCAST: Self = Self::ZERO;

    /// Whether this is the broadcast value.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.is_zero()
    }
}

impl ConnectId {
    /// "No connection", used for locally originated messages
    pub const NONE: Self = Self::ZERO;

    /// Whether this is the "no connection" value.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.is_zero()
    }
}
