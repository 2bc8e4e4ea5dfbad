// A SIP user agent core in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod dialog;
pub mod error;
pub mod message;
pub mod transaction;
pub mod transport;
pub mod ua;
pub use ua::{config::UAConfig, UserAgent, UserAgentBuilder};
