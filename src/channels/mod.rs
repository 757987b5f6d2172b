//! Channel abstraction for message I/O.

pub mod channel;
pub mod chunk;
pub mod telegram;

pub use channel::*;
pub use chunk::chunk_message;
pub use telegram::TelegramChannel;
