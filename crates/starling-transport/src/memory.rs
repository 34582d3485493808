//! In-memory duplex links.
//!
//! A link behaves like a connected TCP pair without touching the network,
//! which lets whole meshes run inside one process.

use crate::transport::{BoxedReader, BoxedWriter};

/// Default in-flight byte capacity of one link direction.
pub const DEFAULT_LINK_CAPACITY: usize = 256 * 1024;

/// One end of an in-memory link.
pub struct LinkEnd {
    /// Read half
    pub reader: BoxedReader,
    /// Write half
    pub writer: BoxedWriter,
}

/// Create a connected pair of link ends.
#[must_use]
pub fn link(capacity: usize) -> (LinkEnd, LinkEnd) {
    let (a, b) = tokio::io::duplex(capacity);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        LinkEnd {
            reader: Box::new(a_read),
            writer: Box::new(a_write),
        },
        LinkEnd {
            reader: Box::new(b_read),
            writer: Box::new(b_write),
        },
    )
}
