//! Session state and command dispatch.

pub mod handlers;
pub mod machine;

pub use handlers::{HandleResult, HandlerContext, handle_command, is_busy_command};
pub use machine::{SessionState, Target, TransferSession};
