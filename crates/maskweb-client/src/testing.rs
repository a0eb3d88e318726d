//! In-process fakes shared by this crate's tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use maskweb_net::{ChannelError, Connector, Frame, ReconnectPolicy, StompTransport};
use maskweb_shared::{ChatMessage, MessageId};
use tokio::sync::{mpsc, Notify};

use crate::active::ActiveServer;
use crate::server::ServerContext;

pub fn context(connector: Arc<AcceptingConnector>) -> ServerContext {
    ServerContext {
        active: ActiveServer::new(),
        changes: Arc::new(Notify::new()),
        policy: ReconnectPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(50),
        },
        request_timeout: Duration::from_secs(5),
        ws_path: "/ws".into(),
        connector,
    }
}

pub fn message(id: MessageId, content: &str) -> ChatMessage {
    ChatMessage {
        id,
        from_name: "ann".into(),
        content: content.into(),
        timestamp: id * 1000,
    }
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Accepts every connection and answers CONNECT with CONNECTED.
#[derive(Default)]
pub struct AcceptingConnector {
    credentials: Arc<Mutex<Vec<Option<String>>>>,
}

impl AcceptingConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `Authorization` header of every CONNECT frame seen so far.
    pub fn credentials(&self) -> Vec<Option<String>> {
        self.credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for AcceptingConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn StompTransport>, ChannelError> {
        let (replies_tx, replies) = mpsc::unbounded_channel();
        Ok(Box::new(Loopback {
            credentials: Arc::clone(&self.credentials),
            replies_tx,
            replies,
        }))
    }
}

struct Loopback {
    credentials: Arc<Mutex<Vec<Option<String>>>>,
    replies_tx: mpsc::UnboundedSender<Frame>,
    replies: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl StompTransport for Loopback {
    async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        if frame.command == "CONNECT" {
            let credential = frame.header("Authorization").map(str::to_string);
            self.credentials.lock().unwrap().push(credential);
            let _ = self.replies_tx.send(Frame::new("CONNECTED"));
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, ChannelError>> {
        self.replies.recv().await.map(Ok)
    }

    async fn close(&mut self) {}
}
