//! Which server, if any, the user is looking at.

use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::server::Server;

/// Shared pointer to the foreground server.
///
/// Messages merged into the active server count as read immediately.
#[derive(Clone, Default)]
pub struct ActiveServer {
    current: Arc<Mutex<Option<Uuid>>>,
}

impl ActiveServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring `server` to the foreground and mark its log as read.
    pub fn select(&self, server: &Server) {
        *self.lock() = Some(server.id());
        server.mark_read();
        tracing::debug!(server = %server.base_url(), "active server changed");
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn current(&self) -> Option<Uuid> {
        *self.lock()
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.current() == Some(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Uuid>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
