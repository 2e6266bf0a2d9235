//! Stream transport: bounded byte buffers and the per-connection channel.

pub mod buffer;
pub mod channel;

pub use self::buffer::Buffer;
pub use self::channel::{Channel, ChannelState};
