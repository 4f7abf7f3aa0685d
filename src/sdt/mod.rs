pub mod channel;
pub mod client;
pub mod config;
pub mod engine;
pub mod events;
pub mod mak;
pub mod member;
pub mod nak;
pub mod retained;
pub mod rx_queue;
pub mod seq;
pub mod timer;
pub mod transport;
pub mod tx_wrap;
