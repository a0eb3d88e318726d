//! Live messaging channel for one server.
//!
//! State machine:
//!
//! ```text
//! Disconnected --start--> Connecting --CONNECTED--> Connected
//!      ^                      |                        |
//!      |                   failure                  failure
//!      |                      v                        v
//!      +----delay---- Disconnected(attempt n/max) <----+
//!                             |
//!                      attempts exhausted
//!                             v
//!                          GivenUp
//! ```
//!
//! Each `start()` opens a new *generation*. Scheduled retries and driver
//! tasks carry the generation they were spawned for and become no-ops once
//! `stop()` (or a later `start()`) has moved it on, so at most one
//! connection attempt is ever in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use maskweb_shared::constants::{
    BROADCAST_TOPIC, MAX_RECONNECT_ATTEMPTS, PRIVATE_QUEUE, RECONNECT_DELAY_SECS,
    SEND_DESTINATION,
};
use maskweb_shared::{ApiError, ChatMessage, MessageId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::ChannelError;
use crate::session::SessionClient;
use crate::stomp::Frame;
use crate::transport::{ws_url, Connector, StompTransport};

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted. Only an explicit `start()` leaves this.
    GivenUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Human-readable progress or failure text, empty when healthy.
    pub error_message: String,
    /// True from `start()` until the channel is connected, stopped or has
    /// given up, including the delay between attempts.
    pub is_connecting: bool,
}

impl ChannelStatus {
    fn idle(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts,
            error_message: String::new(),
            is_connecting: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            delay: Duration::from_secs(RECONNECT_DELAY_SECS),
        }
    }
}

/// Catch-up query used right after every (re)connect.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn messages_after(&self, id: MessageId) -> Result<Vec<ChatMessage>, ApiError>;
}

/// Receives what the channel produces. Implementations must not block.
pub trait ChannelListener: Send + Sync {
    /// Highest message id already held locally, `0` when none.
    fn last_message_id(&self) -> MessageId;

    fn on_messages(&self, batch: Vec<ChatMessage>);

    fn on_status(&self, _status: &ChannelStatus) {}
}

pub struct ChannelParts {
    pub ws_url: String,
    pub policy: ReconnectPolicy,
    pub connector: Arc<dyn Connector>,
    pub history: Arc<dyn HistorySource>,
    pub credential: watch::Receiver<Option<String>>,
    pub listener: Arc<dyn ChannelListener>,
}

#[derive(Clone)]
pub struct MessagingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    ws_url: String,
    host: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    history: Arc<dyn HistorySource>,
    credential: watch::Receiver<Option<String>>,
    listener: Arc<dyn ChannelListener>,
    control: Mutex<Control>,
    status_tx: watch::Sender<ChannelStatus>,
}

struct Control {
    status: ChannelStatus,
    generation: u64,
    attempt_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    outbound: Option<mpsc::Sender<Frame>>,
}

enum Exit {
    Stopped,
    Lost(ChannelError),
}

enum Event {
    Outbound(Option<Frame>),
    Inbound(Option<Result<Frame, ChannelError>>),
}

impl MessagingChannel {
    pub fn new(parts: ChannelParts) -> Self {
        let host = Url::parse(&parts.ws_url)
            .ok()
            .and_then(|url| {
                url.host_str().map(|host| match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                })
            })
            .unwrap_or_default();
        let status = ChannelStatus::idle(parts.policy.max_attempts);
        let (status_tx, _) = watch::channel(status.clone());

        Self {
            inner: Arc::new(ChannelInner {
                ws_url: parts.ws_url,
                host,
                policy: parts.policy,
                connector: parts.connector,
                history: parts.history,
                credential: parts.credential,
                listener: parts.listener,
                control: Mutex::new(Control {
                    status,
                    generation: 0,
                    attempt_task: None,
                    retry_task: None,
                    outbound: None,
                }),
                status_tx,
            }),
        }
    }

    /// Channel for `session`'s server: catch-up goes through the session and
    /// every attempt authenticates with its current credential.
    pub fn for_session(
        session: &SessionClient,
        ws_path: &str,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<Self, ChannelError> {
        Ok(Self::new(ChannelParts {
            ws_url: ws_url(session.base_url(), ws_path)?,
            policy,
            connector,
            history: Arc::new(session.clone()),
            credential: session.subscribe_credential(),
            listener,
        }))
    }

    pub fn ws_url(&self) -> &str {
        &self.inner.ws_url
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.lock().status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().status.state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Begin connecting with a fresh attempt budget. No-op while an attempt
    /// is in flight or the channel is already connected.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.update(move |control| {
            if matches!(
                control.status.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!(url = %inner.ws_url, state = ?control.status.state, "start ignored");
                return;
            }
            if let Some(retry) = control.retry_task.take() {
                retry.abort();
            }

            control.generation += 1;
            control.status.attempts = 0;
            control.status.error_message.clear();
            control.status.state = ConnectionState::Connecting;
            control.status.is_connecting = true;

            info!(url = %inner.ws_url, "messaging channel starting");
            let generation = control.generation;
            control.attempt_task = Some(tokio::spawn(run_attempt(inner, generation)));
        });
    }

    /// Close the channel and suppress every pending or future reconnect.
    pub fn stop(&self) {
        let max_attempts = self.inner.policy.max_attempts;
        self.inner.update(|control| {
            control.generation += 1;
            control.status.attempts = max_attempts;
            if let Some(retry) = control.retry_task.take() {
                retry.abort();
            }
            // A live driver notices the dropped sender and closes gracefully.
            let was_connected = control.outbound.take().is_some();
            if let Some(attempt) = control.attempt_task.take() {
                if !was_connected {
                    attempt.abort();
                }
            }
            control.status.state = ConnectionState::Disconnected;
            control.status.is_connecting = false;
            control.status.error_message.clear();
        });
        info!(url = %self.inner.ws_url, "messaging channel stopped");
    }

    /// Publish a chat message. String content is sent as-is; any other JSON
    /// value is sent as its serialized text. Empty content is ignored.
    pub async fn send(&self, content: &Value) -> Result<(), ChannelError> {
        let content = match content {
            Value::Null => return Ok(()),
            Value::String(text) if text.is_empty() => return Ok(()),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };

        let outbound = {
            let control = self.inner.lock();
            match control.status.state {
                ConnectionState::Connected => control.outbound.clone(),
                _ => None,
            }
        };
        let Some(outbound) = outbound else {
            warn!(url = %self.inner.ws_url, "send attempted while not connected");
            return Err(ChannelError::NotConnected);
        };

        let body = serde_json::json!({ "content": content }).to_string();
        outbound
            .send(Frame::send(SEND_DESTINATION, body))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Wait until the current connect cycle settles: `Ok` once connected,
    /// an error once it gave up or was stopped.
    pub async fn settled(&self) -> Result<(), ChannelError> {
        let mut status_rx = self.subscribe_status();
        let status = status_rx
            .wait_for(|s| s.state == ConnectionState::Connected || !s.is_connecting)
            .await
            .map_err(|_| ChannelError::Closed)?
            .clone();

        match status.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::GivenUp => Err(ChannelError::ReconnectExhausted {
                attempts: status.attempts,
            }),
            _ => Err(ChannelError::NotConnected),
        }
    }
}

impl ChannelInner {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate control state and publish the resulting status. The watch
    /// channel is updated under the lock so observers see changes in order.
    fn update<R>(&self, f: impl FnOnce(&mut Control) -> R) -> R {
        let (result, changed) = {
            let mut control = self.lock();
            let result = f(&mut *control);
            let status = control.status.clone();
            let changed = self.status_tx.send_if_modified(|current| {
                if *current == status {
                    return false;
                }
                *current = status.clone();
                true
            });
            (result, changed.then_some(status))
        };
        if let Some(status) = changed {
            self.listener.on_status(&status);
        }
        result
    }

    fn on_connected(&self, generation: u64, outbound: mpsc::Sender<Frame>) -> bool {
        self.update(|control| {
            if control.generation != generation {
                return false;
            }
            control.status.state = ConnectionState::Connected;
            control.status.attempts = 0;
            control.status.error_message.clear();
            control.status.is_connecting = false;
            control.outbound = Some(outbound);
            true
        })
    }

    fn on_failure(self: &Arc<Self>, generation: u64, err: ChannelError) {
        let inner = Arc::clone(self);
        self.update(move |control| {
            if control.generation != generation {
                debug!(error = %err, "failure of a superseded connection ignored");
                return;
            }
            control.outbound = None;
            control.attempt_task = None;

            let max = inner.policy.max_attempts;
            if control.status.attempts < max {
                control.status.attempts += 1;
                control.status.state = ConnectionState::Disconnected;
                control.status.is_connecting = true;
                control.status.error_message =
                    format!("reconnecting ({}/{max})...", control.status.attempts);
                warn!(
                    url = %inner.ws_url,
                    error = %err,
                    attempt = control.status.attempts,
                    max,
                    "messaging channel lost, scheduling reconnect"
                );

                let delay = inner.policy.delay;
                control.retry_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.retry(generation);
                }));
            } else {
                control.status.state = ConnectionState::GivenUp;
                control.status.is_connecting = false;
                control.status.error_message =
                    "connection failed: maximum reconnect attempts reached".to_string();
                error!(url = %inner.ws_url, error = %err, "messaging channel gave up");
            }
        });
    }

    /// Fired by a scheduled retry. Re-checks everything at fire time.
    fn retry(self: &Arc<Self>, generation: u64) {
        let inner = Arc::clone(self);
        self.update(move |control| {
            if control.generation != generation
                || control.status.state != ConnectionState::Disconnected
            {
                debug!("stale reconnect timer ignored");
                return;
            }
            control.retry_task = None;
            control.status.state = ConnectionState::Connecting;
            debug!(url = %inner.ws_url, attempt = control.status.attempts, "reconnecting");
            control.attempt_task = Some(tokio::spawn(run_attempt(inner, generation)));
        });
    }

    /// Open a transport and complete the STOMP handshake.
    async fn open(&self) -> Result<Box<dyn StompTransport>, ChannelError> {
        let credential = self.credential.borrow().clone();
        let mut transport = self.connector.connect(&self.ws_url).await?;
        transport
            .send(&Frame::connect(&self.host, credential.as_deref()))
            .await?;

        let reply = transport.next_frame().await;
        match reply {
            Some(Ok(frame)) if frame.command == "CONNECTED" => Ok(transport),
            Some(Ok(frame)) if frame.command == "ERROR" => {
                let reason = frame.header("message").unwrap_or(&frame.body).to_string();
                transport.close().await;
                Err(ChannelError::Handshake(reason))
            }
            Some(Ok(frame)) => {
                transport.close().await;
                Err(ChannelError::Handshake(format!(
                    "unexpected {} frame",
                    frame.command
                )))
            }
            Some(Err(e)) => Err(e),
            None => Err(ChannelError::Handshake("closed during handshake".into())),
        }
    }

    /// Subscribe, then merge everything missed while disconnected.
    async fn catch_up(&self, transport: &mut dyn StompTransport) -> Result<(), ChannelError> {
        transport
            .send(&Frame::subscribe("sub-0", BROADCAST_TOPIC))
            .await?;
        transport
            .send(&Frame::subscribe("sub-1", PRIVATE_QUEUE))
            .await?;

        let after = self.listener.last_message_id();
        match self.history.messages_after(after).await {
            Ok(batch) if batch.is_empty() => {}
            Ok(batch) => {
                debug!(after, count = batch.len(), "merging missed messages");
                self.listener.on_messages(batch);
            }
            Err(e) => warn!(after, error = %e, "catch-up fetch failed"),
        }
        Ok(())
    }

    async fn pump(
        &self,
        transport: &mut dyn StompTransport,
        outbound: &mut mpsc::Receiver<Frame>,
    ) -> Exit {
        loop {
            let event = tokio::select! {
                frame = outbound.recv() => Event::Outbound(frame),
                frame = transport.next_frame() => Event::Inbound(frame),
            };

            match event {
                Event::Outbound(Some(frame)) => {
                    if let Err(e) = transport.send(&frame).await {
                        return Exit::Lost(e);
                    }
                }
                Event::Outbound(None) => return Exit::Stopped,
                Event::Inbound(Some(Ok(frame))) => {
                    if let Some(e) = self.dispatch(frame) {
                        return Exit::Lost(e);
                    }
                }
                Event::Inbound(Some(Err(ChannelError::Frame(e)))) => {
                    warn!(error = %e, "dropping malformed frame");
                }
                Event::Inbound(Some(Err(e))) => return Exit::Lost(e),
                Event::Inbound(None) => return Exit::Lost(ChannelError::Closed),
            }
        }
    }

    fn dispatch(&self, frame: Frame) -> Option<ChannelError> {
        match frame.command.as_str() {
            "MESSAGE" => {
                match serde_json::from_str::<ChatMessage>(&frame.body) {
                    Ok(message) => {
                        debug!(
                            destination = frame.header("destination").unwrap_or_default(),
                            id = message.id,
                            "live message"
                        );
                        self.listener.on_messages(vec![message]);
                    }
                    Err(e) => warn!(error = %e, "undecodable message body dropped"),
                }
                None
            }
            "ERROR" => Some(ChannelError::Transport(
                frame.header("message").unwrap_or(&frame.body).to_string(),
            )),
            other => {
                debug!(command = other, "ignoring frame");
                None
            }
        }
    }
}

async fn run_attempt(inner: Arc<ChannelInner>, generation: u64) {
    debug!(url = %inner.ws_url, generation, "opening messaging transport");
    let mut transport = match inner.open().await {
        Ok(transport) => transport,
        Err(e) => return inner.on_failure(generation, e),
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    if !inner.on_connected(generation, outbound_tx) {
        transport.close().await;
        return;
    }
    info!(url = %inner.ws_url, "messaging channel connected");

    if let Err(e) = inner.catch_up(transport.as_mut()).await {
        transport.close().await;
        return inner.on_failure(generation, e);
    }

    match inner.pump(transport.as_mut(), &mut outbound_rx).await {
        Exit::Stopped => {
            if let Err(e) = transport.send(&Frame::disconnect()).await {
                debug!(error = %e, "DISCONNECT not delivered");
            }
            transport.close().await;
        }
        Exit::Lost(e) => {
            transport.close().await;
            inner.on_failure(generation, e);
        }
    }
}
