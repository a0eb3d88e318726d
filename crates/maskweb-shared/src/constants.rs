/// Application name
pub const APP_NAME: &str = "maskweb";

/// Request header carrying the credential (raw token, no scheme prefix)
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Response header a server uses to rotate the credential
pub const REFRESHED_TOKEN_HEADER: &str = "X-Refreshed-Token";

/// Path of the messaging endpoint, appended to the base address
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Broadcast destination every client subscribes to
pub const BROADCAST_TOPIC: &str = "/topic/messages";

/// Per-user destination for direct messages
pub const PRIVATE_QUEUE: &str = "/user/queue/messages";

/// Application destination outgoing chat messages are published to
pub const SEND_DESTINATION: &str = "/app/chat";

/// Automatic reconnect attempts before a channel gives up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Fixed delay between reconnect attempts in seconds
pub const RECONNECT_DELAY_SECS: u64 = 10;

/// Default per-request HTTP timeout in seconds
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Key the server registry is persisted under
pub const REGISTRY_STORAGE_KEY: &str = "serverList";

/// Namespace of the media cache
pub const MEDIA_CACHE_NAME: &str = "maskweb-media-cache-v1";
