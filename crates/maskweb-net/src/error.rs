use thiserror::Error;

use crate::stomp::FrameError;

/// Failures of the messaging channel.
///
/// These never escape as panics: the channel folds them into its status and
/// the reconnect state machine. Only [`crate::MessagingChannel::send`] and
/// [`crate::MessagingChannel::settled`] hand them to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Not connected to the server")]
    NotConnected,

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection failed after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
}
