//! Command message construction with in-band or out-of-band payloads

pub mod builder;
pub mod message;

pub use builder::{MessageBuilder, MsgSpec};
pub use message::{GslMessage, PayloadLocation};
