//! An implementation of SDT, the session data transport of ANSI E1.17 (ACN).
//!
//! SDT forms channels between a leader and its members over UDP, bonds members in both
//!  directions, delivers wrappers reliably with NAK based retransmission, and tracks liveness
//!  through keep-alives and acknowledgement requests.
//!
//! The protocol engine in [sdt::engine] is I/O free and driven with explicit time, so it can
//!  be tested deterministically (see [test_util]). [end_point] runs it on a tokio UDP socket.

pub mod end_point;
pub mod sdt;
pub mod test_util;
pub mod util;
pub mod wire;
