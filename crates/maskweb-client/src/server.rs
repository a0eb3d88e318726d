//! One registered backend: its session, its messaging channel and its log.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use maskweb_net::{
    ChannelListener, ChannelStatus, ConnectionState, Connector, MessagingChannel,
    ReconnectPolicy, Session, SessionClient, WsConnector,
};
use maskweb_shared::{ChatMessage, MessageId};
use maskweb_store::ServerRecord;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::active::ActiveServer;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::merge::{merge_log, summarize, unread_count};

/// Everything a server needs from its surroundings.
#[derive(Clone)]
pub struct ServerContext {
    pub active: ActiveServer,
    /// Notified whenever persisted server fields may have changed.
    pub changes: Arc<Notify>,
    pub policy: ReconnectPolicy,
    pub request_timeout: Duration,
    pub ws_path: String,
    pub connector: Arc<dyn Connector>,
}

impl ServerContext {
    pub fn new(config: &ClientConfig, active: ActiveServer) -> Self {
        Self {
            active,
            changes: Arc::new(Notify::new()),
            policy: config.reconnect_policy(),
            request_timeout: config.request_timeout,
            ws_path: config.ws_path.clone(),
            connector: Arc::new(WsConnector),
        }
    }
}

/// Plain-data view of a server at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerState {
    pub img: String,
    pub title: String,
    pub description: String,
    /// Last activity, epoch milliseconds. Drives registry order.
    pub timestamp: i64,
    pub base_url: String,
    pub preview: String,
    pub watch_id: MessageId,
    pub unread_count: i64,
    /// Ascending by id, unique by id.
    pub log: Vec<ChatMessage>,
    pub user_profile: Value,
}

/// Handle to a server. Clones share the same server.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
    session: SessionClient,
    channel: MessagingChannel,
}

struct ServerCore {
    id: Uuid,
    state: Mutex<ServerState>,
    active: ActiveServer,
    changes: Arc<Notify>,
}

impl ServerCore {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touched(&self) {
        self.changes.notify_one();
    }

    /// Merge `batch` and recompute the summary fields. Returns how many
    /// previously unknown messages were added.
    fn merge(&self, batch: Vec<ChatMessage>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let active = self.active.is_active(self.id);
        let added = {
            let mut state = self.lock();
            let before = state.log.len();
            state.log = merge_log(&state.log, batch);
            if let Some(summary) = summarize(&state.log, state.watch_id, active) {
                state.preview = summary.preview;
                state.timestamp = summary.timestamp;
                state.watch_id = summary.watch_id;
                state.unread_count = summary.unread_count;
            }
            debug!(
                server = %state.base_url,
                size = state.log.len(),
                unread = state.unread_count,
                "log merged"
            );
            state.log.len() - before
        };
        self.touched();
        added
    }
}

impl ChannelListener for ServerCore {
    fn last_message_id(&self) -> MessageId {
        self.lock().log.last().map(|m| m.id).unwrap_or(0)
    }

    fn on_messages(&self, batch: Vec<ChatMessage>) {
        self.merge(batch);
    }

    fn on_status(&self, status: &ChannelStatus) {
        debug!(
            server = %self.lock().base_url,
            state = ?status.state,
            attempts = status.attempts,
            "channel status"
        );
    }
}

impl Server {
    /// Rebuild a server from its persisted form. Connection state always
    /// starts out disconnected.
    pub fn new(record: ServerRecord, context: &ServerContext) -> Result<Self> {
        let session = SessionClient::new(&record.base_url, context.request_timeout)?;
        session.set_credential(record.token.clone());

        let core = Arc::new(ServerCore {
            id: Uuid::new_v4(),
            state: Mutex::new(ServerState {
                img: record.img,
                title: record.title,
                description: record.description,
                timestamp: record.timestamp,
                base_url: session.base_url().to_string(),
                preview: record.preview,
                watch_id: record.watch_id,
                unread_count: 0,
                log: Vec::new(),
                user_profile: Value::Null,
            }),
            active: context.active.clone(),
            changes: Arc::clone(&context.changes),
        });

        let listener: Arc<dyn ChannelListener> = core.clone();
        let channel = MessagingChannel::for_session(
            &session,
            &context.ws_path,
            context.policy,
            Arc::clone(&context.connector),
            listener,
        )?;

        Ok(Self {
            core,
            session,
            channel,
        })
    }

    /// A newly registered server, stamped with the current time so it sorts
    /// first.
    pub fn from_address(base_url: &str, context: &ServerContext) -> Result<Self> {
        let record = ServerRecord {
            title: base_url.to_string(),
            base_url: base_url.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            ..Default::default()
        };
        Self::new(record, context)
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn base_url(&self) -> &str {
        self.session.base_url()
    }

    pub fn session(&self) -> &SessionClient {
        &self.session
    }

    pub fn channel(&self) -> &MessagingChannel {
        &self.channel
    }

    pub fn snapshot(&self) -> ServerState {
        self.core.lock().clone()
    }

    pub fn log(&self) -> Vec<ChatMessage> {
        self.core.lock().log.clone()
    }

    pub fn timestamp(&self) -> i64 {
        self.core.lock().timestamp
    }

    pub fn unread_count(&self) -> i64 {
        self.core.lock().unread_count
    }

    pub fn status(&self) -> ChannelStatus {
        self.channel.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Persisted form, carrying the current (possibly refreshed) credential.
    pub fn to_record(&self) -> ServerRecord {
        let state = self.core.lock();
        ServerRecord {
            img: state.img.clone(),
            title: state.title.clone(),
            description: state.description.clone(),
            timestamp: state.timestamp,
            base_url: state.base_url.clone(),
            preview: state.preview.clone(),
            token: self.session.credential(),
            watch_id: state.watch_id,
        }
    }

    /// Fold messages obtained elsewhere (for example a history query made
    /// through [`Server::session`]) into the log. Returns how many were new.
    pub fn merge(&self, batch: Vec<ChatMessage>) -> usize {
        self.core.merge(batch)
    }

    /// Everything currently in the log counts as seen.
    pub(crate) fn mark_read(&self) {
        {
            let mut state = self.core.lock();
            if let Some(last) = state.log.last().map(|m| m.id) {
                state.watch_id = last;
            }
            state.unread_count = unread_count(
                state.log.last().map(|m| m.id).unwrap_or(0),
                state.watch_id,
            );
        }
        self.core.touched();
    }

    /// Refresh title, description and image from the server, load the
    /// user's profile, then start the messaging channel. No-op when already
    /// connected.
    pub async fn init_server(&self) -> Result<()> {
        if self.channel.state() == ConnectionState::Connected {
            return Ok(());
        }

        let version = self.session.get_version().await?;
        {
            let mut state = self.core.lock();
            state.title = version.name;
            state.description = version.description;
            state.img = version.avatar_url;
        }
        self.core.touched();

        let profile = self.session.get_self().await?;
        self.core.lock().user_profile = profile;

        info!(server = %self.base_url(), "server initialised, connecting");
        self.channel.start();
        Ok(())
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Session> {
        Ok(self.session.authenticate(email, password).await?)
    }

    pub async fn register(&self, username: &str, password: &str, email: &str) -> Result<Session> {
        Ok(self.session.register(username, password, email).await?)
    }

    pub fn credential(&self) -> Option<String> {
        self.session.credential()
    }

    pub fn set_credential(&self, token: Option<String>) {
        self.session.set_credential(token);
    }

    /// Fetch the page of history just before the oldest known message.
    /// Returns how many messages were new. An empty log has nothing older.
    pub async fn load_older(&self) -> Result<usize> {
        let Some(oldest) = self.core.lock().log.first().map(|m| m.id) else {
            return Ok(0);
        };
        let batch = self.session.messages_before(oldest).await?;
        Ok(self.core.merge(batch))
    }

    pub async fn send(&self, content: &Value) -> Result<()> {
        Ok(self.channel.send(content).await?)
    }

    pub fn connect(&self) {
        self.channel.start();
    }

    pub fn disconnect(&self) {
        self.channel.stop();
    }

    /// Resolves once the current connect cycle has connected (`Ok`) or has
    /// given up or been stopped (`Err`).
    pub async fn wait_settled(&self) -> Result<()> {
        Ok(self.channel.settled().await?)
    }

    /// Wake the registry's persister whenever the credential changes,
    /// including refreshes issued by the server.
    pub(crate) fn watch_credential(&self) -> JoinHandle<()> {
        let mut credential = self.session.subscribe_credential();
        let core = Arc::downgrade(&self.core);
        tokio::spawn(async move {
            while credential.changed().await.is_ok() {
                match core.upgrade() {
                    Some(core) => core.touched(),
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, message, AcceptingConnector};
    use serde_json::json;
    use wiremock::matchers::{path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": data }))
    }

    fn record(base_url: &str) -> ServerRecord {
        ServerRecord {
            img: "a.png".into(),
            title: "Home".into(),
            description: "d".into(),
            timestamp: 42,
            base_url: base_url.into(),
            preview: "ann: hi".into(),
            token: Some("tok".into()),
            watch_id: 3,
        }
    }

    #[tokio::test]
    async fn restored_server_starts_disconnected_with_its_credential() {
        let ctx = context(AcceptingConnector::new());
        let server = Server::new(record("http://h:1/"), &ctx).unwrap();

        assert_eq!(server.state(), ConnectionState::Disconnected);
        assert_eq!(server.credential().as_deref(), Some("tok"));
        assert_eq!(server.base_url(), "http://h:1");
        assert_eq!(server.channel().ws_url(), "ws://h:1/ws");
        assert_eq!(server.to_record(), record("http://h:1"));
    }

    #[tokio::test]
    async fn merged_messages_update_summary_fields() {
        let ctx = context(AcceptingConnector::new());
        let server = Server::new(record("http://h"), &ctx).unwrap();

        server.core.on_messages(vec![message(5, "hello"), message(4, "older")]);

        let state = server.snapshot();
        assert_eq!(state.log.iter().map(|m| m.id).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(state.preview, "ann: hello");
        assert_eq!(state.timestamp, message(5, "").timestamp);
        assert_eq!(state.unread_count, 2);
        assert_eq!(server.core.last_message_id(), 5);
    }

    #[tokio::test]
    async fn merge_wakes_the_persister() {
        let ctx = context(AcceptingConnector::new());
        let server = Server::new(record("http://h"), &ctx).unwrap();

        let notified = ctx.changes.notified();
        server.core.on_messages(vec![message(1, "x")]);
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn active_server_keeps_unread_at_zero() {
        let ctx = context(AcceptingConnector::new());
        let server = Server::new(record("http://h"), &ctx).unwrap();
        server.core.on_messages(vec![message(7, "a")]);
        assert_eq!(server.unread_count(), 4);

        ctx.active.select(&server);
        assert_eq!(server.snapshot().watch_id, 7);
        assert_eq!(server.unread_count(), 0);

        server.core.on_messages(vec![message(9, "b")]);
        assert_eq!(server.snapshot().watch_id, 9);
        assert_eq!(server.unread_count(), 0);

        ctx.active.clear();
        server.core.on_messages(vec![message(12, "c")]);
        assert_eq!(server.unread_count(), 3);
    }

    #[tokio::test]
    async fn init_server_refreshes_metadata_and_connects() {
        let http = MockServer::start().await;
        Mock::given(path("/unauth/version"))
            .respond_with(ok(json!({
                "name": "Maskweb HQ", "description": "main", "avatarUrl": "hq.png"
            })))
            .mount(&http)
            .await;
        Mock::given(path("/user/getSelf"))
            .respond_with(ok(json!({ "username": "ann" })))
            .mount(&http)
            .await;
        Mock::given(path("/api/messages/after"))
            .and(query_param("id", "0"))
            .respond_with(ok(json!([
                { "id": 1, "fromName": "bob", "content": "hey", "timestamp": 10 }
            ])))
            .mount(&http)
            .await;

        let connector = AcceptingConnector::new();
        let ctx = context(connector.clone());
        let server = Server::new(record(&http.uri()), &ctx).unwrap();

        server.init_server().await.unwrap();
        server.wait_settled().await.unwrap();

        let state = server.snapshot();
        assert_eq!(state.title, "Maskweb HQ");
        assert_eq!(state.img, "hq.png");
        assert_eq!(state.user_profile["username"], "ann");
        assert_eq!(connector.credentials(), vec![Some("tok".to_string())]);

        crate::testing::eventually(|| server.log().len() == 1).await;
        assert_eq!(server.snapshot().preview, "bob: hey");

        // already connected
        server.init_server().await.unwrap();
        assert_eq!(connector.credentials().len(), 1);
    }

    #[tokio::test]
    async fn init_server_failure_leaves_channel_idle() {
        let http = MockServer::start().await;
        Mock::given(path("/unauth/version"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&http)
            .await;

        let connector = AcceptingConnector::new();
        let ctx = context(connector.clone());
        let server = Server::new(record(&http.uri()), &ctx).unwrap();

        let err = server.init_server().await.unwrap_err();
        assert!(matches!(
            err,
            crate::ClientError::Api(maskweb_shared::ApiError::Rejected { status: 503, .. })
        ));
        assert_eq!(server.state(), ConnectionState::Disconnected);
        assert!(connector.credentials().is_empty());
    }

    #[tokio::test]
    async fn load_older_merges_the_previous_page() {
        let http = MockServer::start().await;
        Mock::given(path("/api/messages/before"))
            .and(query_param("id", "10"))
            .respond_with(ok(json!([
                { "id": 8, "fromName": "ann", "content": "a", "timestamp": 1 },
                { "id": 9, "fromName": "ann", "content": "b", "timestamp": 2 },
                { "id": 10, "fromName": "ann", "content": "c", "timestamp": 3 }
            ])))
            .mount(&http)
            .await;

        let ctx = context(AcceptingConnector::new());
        let server = Server::new(record(&http.uri()), &ctx).unwrap();
        assert_eq!(server.load_older().await.unwrap(), 0);

        server.core.on_messages(vec![message(10, "c"), message(11, "d")]);
        assert_eq!(server.load_older().await.unwrap(), 2);
        assert_eq!(
            server.log().iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![8, 9, 10, 11]
        );
        assert_eq!(server.snapshot().preview, "ann: d");
    }

    #[tokio::test]
    async fn login_credential_is_persisted_in_the_record() {
        let http = MockServer::start().await;
        Mock::given(path("/unauth/login"))
            .respond_with(ok(json!({ "token": "fresh" })))
            .mount(&http)
            .await;

        let ctx = context(AcceptingConnector::new());
        let server = Server::new(
            ServerRecord {
                base_url: http.uri(),
                ..Default::default()
            },
            &ctx,
        )
        .unwrap();
        let watcher = server.watch_credential();

        let notified = ctx.changes.notified();
        server.authenticate("a@b.c", "pw").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .unwrap();

        assert_eq!(server.to_record().token.as_deref(), Some("fresh"));
        watcher.abort();
    }

    #[tokio::test]
    async fn refreshed_credential_reaches_the_next_channel_connect() {
        let http = MockServer::start().await;
        Mock::given(path("/user/getSelf"))
            .respond_with(
                ok(json!({ "username": "ann" })).insert_header("X-Refreshed-Token", "rotated"),
            )
            .mount(&http)
            .await;

        let connector = AcceptingConnector::new();
        let ctx = context(connector.clone());
        let server = Server::new(record(&http.uri()), &ctx).unwrap();

        server.connect();
        server.wait_settled().await.unwrap();

        server.session().get_self().await.unwrap();
        assert_eq!(server.credential().as_deref(), Some("rotated"));

        server.disconnect();
        server.connect();
        server.wait_settled().await.unwrap();

        assert_eq!(
            connector.credentials(),
            vec![Some("tok".to_string()), Some("rotated".to_string())]
        );
    }

    #[tokio::test]
    async fn send_while_disconnected_is_refused() {
        let ctx = context(AcceptingConnector::new());
        let server = Server::new(record("http://h"), &ctx).unwrap();
        let err = server.send(&json!("hi")).await.unwrap_err();
        assert!(matches!(
            err,
            crate::ClientError::Channel(maskweb_net::ChannelError::NotConnected)
        ));
    }
}
