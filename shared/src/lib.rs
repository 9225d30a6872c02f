pub mod addressing;
pub mod codec;

pub use addressing::*;
pub use codec::{DecodeError, InboundMessage, InboundUpdate, TextMessage, WireUpdate};
