//! The ordered collection of every known server, persisted on change.
//!
//! Order is most recent activity first. Any change to a persisted server
//! field wakes a background task that re-serializes the whole registry;
//! write failures are logged and never roll back in-memory state.

use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use maskweb_store::{cache_key, Database, ServerRecord};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::active::ActiveServer;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::server::{Server, ServerContext};

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    entries: Mutex<Vec<Entry>>,
    db: Mutex<Database>,
    context: ServerContext,
    last_saved: Mutex<Option<Vec<ServerRecord>>>,
    persister: Mutex<Option<JoinHandle<()>>>,
}

struct Entry {
    server: Server,
    credential_watch: JoinHandle<()>,
}

impl Entry {
    fn new(server: Server) -> Self {
        let credential_watch = server.watch_credential();
        Self {
            server,
            credential_watch,
        }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.credential_watch.abort();
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(persister) = lock(&self.persister).take() {
            persister.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sort_by_recency(entries: &mut [Entry]) {
    entries.sort_by_key(|e| Reverse(e.server.timestamp()));
}

impl Registry {
    /// Open the configured database, restore the registry and register the
    /// configured default server if nothing was restored.
    pub fn init(config: &ClientConfig) -> Result<Self> {
        let db = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        let registry = Self::open(db, ServerContext::new(config, ActiveServer::new()))?;

        if registry.is_empty() {
            if let Some(address) = &config.default_server {
                info!(server = %address, "registering default server");
                registry.add_address(address)?;
            }
        }
        Ok(registry)
    }

    /// Restore every persisted server. Must be called inside a tokio runtime.
    pub fn open(db: Database, context: ServerContext) -> Result<Self> {
        let records = db.load_server_records().unwrap_or_else(|e| {
            warn!(error = %e, "persisted server registry unreadable, starting empty");
            Vec::new()
        });

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let address = record.base_url.clone();
            match Server::new(record, &context) {
                Ok(server) => entries.push(Entry::new(server)),
                Err(e) => warn!(server = %address, error = %e, "skipping unusable server record"),
            }
        }
        sort_by_recency(&mut entries);
        info!(count = entries.len(), "server registry restored");

        let inner = Arc::new(RegistryInner {
            entries: Mutex::new(entries),
            db: Mutex::new(db),
            context,
            last_saved: Mutex::new(None),
            persister: Mutex::new(None),
        });
        let changes = Arc::clone(&inner.context.changes);
        *lock(&inner.persister) = Some(spawn_persister(Arc::downgrade(&inner), changes));

        Ok(Self { inner })
    }

    pub fn context(&self) -> &ServerContext {
        &self.inner.context
    }

    pub fn active(&self) -> &ActiveServer {
        &self.inner.context.active
    }

    /// Build a server for `base_url` with this registry's settings and add it.
    pub fn add_address(&self, base_url: &str) -> Result<Server> {
        let server = Server::from_address(base_url, &self.inner.context)?;
        self.add(server.clone())?;
        Ok(server)
    }

    pub fn add(&self, server: Server) -> Result<()> {
        {
            let mut entries = lock(&self.inner.entries);
            if entries.iter().any(|e| e.server.id() == server.id()) {
                return Err(ClientError::DuplicateServer(server.base_url().to_string()));
            }
            debug!(server = %server.base_url(), "server added");
            entries.push(Entry::new(server));
            sort_by_recency(&mut entries);
        }
        self.changed();
        Ok(())
    }

    /// Re-sort after `server` changed and persist it.
    pub fn update(&self, server: &Server) -> Result<()> {
        {
            let mut entries = lock(&self.inner.entries);
            let entry = entries
                .iter_mut()
                .find(|e| e.server.id() == server.id())
                .ok_or(ClientError::UnknownServer(server.id()))?;
            entry.server = server.clone();
            sort_by_recency(&mut entries);
        }
        self.changed();
        Ok(())
    }

    /// Disconnect and forget a server.
    pub fn remove(&self, id: Uuid) -> Result<Server> {
        let entry = {
            let mut entries = lock(&self.inner.entries);
            let index = entries
                .iter()
                .position(|e| e.server.id() == id)
                .ok_or(ClientError::UnknownServer(id))?;
            entries.remove(index)
        };
        let server = entry.server.clone();
        server.disconnect();
        drop(entry);

        if self.inner.context.active.is_active(id) {
            self.inner.context.active.clear();
        }
        info!(server = %server.base_url(), "server removed");
        self.changed();
        Ok(server)
    }

    /// Replace the whole collection. Servers left out are disconnected.
    pub fn replace_all(&self, servers: Vec<Server>) {
        let dropped = {
            let mut entries = lock(&self.inner.entries);
            let mut kept = Vec::with_capacity(servers.len());
            for server in servers {
                if kept.iter().any(|e: &Entry| e.server.id() == server.id()) {
                    continue;
                }
                match entries.iter().position(|e| e.server.id() == server.id()) {
                    Some(index) => kept.push(entries.swap_remove(index)),
                    None => kept.push(Entry::new(server)),
                }
            }
            sort_by_recency(&mut kept);
            std::mem::replace(&mut *entries, kept)
        };

        for entry in &dropped {
            entry.server.disconnect();
        }
        debug!(dropped = dropped.len(), "server registry replaced");
        self.changed();
    }

    /// Every server, most recently active first.
    pub fn servers(&self) -> Vec<Server> {
        let mut entries = lock(&self.inner.entries);
        sort_by_recency(&mut entries);
        entries.iter().map(|e| e.server.clone()).collect()
    }

    pub fn get(&self, id: Uuid) -> Option<Server> {
        lock(&self.inner.entries)
            .iter()
            .find(|e| e.server.id() == id)
            .map(|e| e.server.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the registry now instead of waiting for the background task.
    pub fn persist_now(&self) {
        self.inner.persist();
    }

    /// Bytes of a private file, served from the media cache when present.
    pub async fn private_file(&self, server: &Server, file_id: i64) -> Result<Vec<u8>> {
        let address = format!(
            "{}/file/private/{}/{}",
            server.base_url(),
            file_id,
            server.credential().unwrap_or_default()
        );

        let cached = lock(&self.inner.db).media_cache().get(&address)?;
        if let Some(bytes) = cached {
            debug!(key = %cache_key(&address), "media cache hit");
            return Ok(bytes);
        }

        let bytes = server.session().private_file(file_id).await?;
        if let Err(e) = lock(&self.inner.db).media_cache().put(&address, &bytes, None) {
            warn!(error = %e, "failed to cache media");
        }
        Ok(bytes)
    }

    fn changed(&self) {
        self.inner.context.changes.notify_one();
    }
}

impl RegistryInner {
    fn persist(&self) {
        let records: Vec<ServerRecord> = {
            let mut entries = lock(&self.entries);
            sort_by_recency(&mut entries);
            entries.iter().map(|e| e.server.to_record()).collect()
        };

        let mut last_saved = lock(&self.last_saved);
        if last_saved.as_ref() == Some(&records) {
            return;
        }

        match lock(&self.db).save_server_records(&records) {
            Ok(()) => *last_saved = Some(records),
            Err(e) => warn!(error = %e, "failed to persist server registry"),
        }
    }
}

fn spawn_persister(registry: Weak<RegistryInner>, changes: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            changes.notified().await;
            match registry.upgrade() {
                Some(inner) => inner.persist(),
                None => break,
            }
        }
    })
}
