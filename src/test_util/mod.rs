//! Utilities for testing code that uses SDT. They drive [crate::sdt::engine::SdtEngine]s
//!  against each other without sockets or a runtime, with explicit time.
//!
//! They are used for testing SDT itself, but they are also exported for application testing,
//!  which is why they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod node;
pub mod transport;

pub use node::{exchange, join_nodes, joined_pair, test_addr, test_cid, SdtTestNode};
pub use transport::{SentDatagram, TrackingDatagramTransport};
