//! Transport layer module.

pub mod descriptors;
pub mod ffs;
pub mod mock;
pub mod traits;
pub mod utp;

pub use ffs::FfsTransport;
pub use mock::MockTransport;
pub use traits::{Inbound, Transport, TransportError};
pub use utp::UtpTransport;
