// Server-facing networking: authenticated request/response calls and the
// live STOMP messaging channel with bounded reconnect.

pub mod channel;
pub mod error;
pub mod session;
pub mod stomp;
pub mod transport;

pub use channel::{
    ChannelListener, ChannelParts, ChannelStatus, ConnectionState, HistorySource,
    MessagingChannel, ReconnectPolicy,
};
pub use error::ChannelError;
pub use session::{Session, SessionClient};
pub use stomp::{Frame, FrameError};
pub use transport::{ws_url, Connector, StompTransport, WsConnector};
