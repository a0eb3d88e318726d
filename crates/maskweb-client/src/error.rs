use maskweb_net::ChannelError;
use maskweb_shared::ApiError;
use maskweb_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Messaging error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown server: {0}")]
    UnknownServer(Uuid),

    #[error("Server already registered: {0}")]
    DuplicateServer(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
