//! Multi-node mesh fixtures.

mod mesh;
mod slow_link;

pub use mesh::{CaptureSink, MeshFixture, Recorder};
pub use slow_link::{CircuitLog, SlowLink};
