//! Shared types, seams and error hierarchy for Relay.

pub mod error;
pub mod message;
pub mod model;
pub mod tool;

pub use error::{ConfigError, ModelError, RelayError, ToolError};
pub use message::*;
pub use model::{ModelClient, ReplyFuture};
pub use tool::*;
