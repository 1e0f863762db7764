//! Protocol module - framing for both daemon transports.

pub mod command;
pub mod constants;
pub mod frame;
pub mod message;
pub mod reply;

pub use command::Command;
pub use constants::*;
pub use frame::{Frame, FrameError, FrameTag};
pub use message::{MessageBody, MessageError, UtpMessage};
pub use reply::Reply;
