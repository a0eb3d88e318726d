//! # maskweb-shared
//!
//! Types shared by every maskweb crate: the chat message shape exchanged with
//! servers, message-content interpretation, protocol constants, and the
//! request error taxonomy.

pub mod constants;
pub mod content;
pub mod error;
pub mod secret;
pub mod types;

pub use content::MessageContent;
pub use error::ApiError;
pub use types::{ApiResponse, ChatMessage, MessageId, ServerVersion};
