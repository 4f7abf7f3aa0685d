//! Wire format: ACN root layer, SDT base layer messages, client blocks and wrapped SDT messages.
//!  All integers are big-endian.

pub mod channel_params;
pub mod cid;
pub mod pdu;
pub mod reason_code;
pub mod root_layer;
pub mod sdt_messages;
pub mod transport_addr;
pub mod wrapped_messages;
