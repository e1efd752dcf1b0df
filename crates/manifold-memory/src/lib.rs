//! In-memory transport adapter for the manifold bus.
//!
//! A queue per path, drained by the core's reference pull loop. Useful as
//! the test vehicle and for wiring in-process modules over the same bus API
//! they would use against a broker.

mod error;
mod transport;

pub use error::Error;
pub use transport::{MemoryTransport, MemoryTransportOptions, ProducedRecord};
