//! Test fixtures

mod loopback;

pub use loopback::{Datagram, LoopbackNetwork, LoopbackNode, decode_message};
