//! Typed client wrapper over the coordination store.
//!
//! One client owns one session and one event channel. After a session expiry
//! the client can [`reconnect`], which opens a fresh session that keeps
//! delivering into the same channel, so the consumer's dispatch loop survives
//! expiry without re-plumbing.
//!
//! [`reconnect`]: CoordClient::reconnect

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use super::event::{CoordEvent, Watch};
use super::payload::KvPayload;
use super::store::{CreateMode, MemoryCoordStore, SessionId};
use crate::{Error, Result};

/// A session-scoped handle to the coordination store.
pub struct CoordClient {
    store: Arc<MemoryCoordStore>,
    session: Mutex<SessionId>,
    tx: UnboundedSender<CoordEvent>,
    events: Mutex<Option<UnboundedReceiver<CoordEvent>>>,
}

impl CoordClient {
    /// Open a session against the store.
    pub fn connect(store: Arc<MemoryCoordStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = store.connect(tx.clone());
        Self {
            store,
            session: Mutex::new(session),
            tx,
            events: Mutex::new(Some(rx)),
        }
    }

    /// Take the event receiver; the dispatch loop calls this exactly once.
    pub fn take_events(&self) -> Option<UnboundedReceiver<CoordEvent>> {
        self.events.lock().take()
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_alive(*self.session.lock())
    }

    /// The current session id; changes across reconnects.
    pub fn session_id(&self) -> SessionId {
        *self.session.lock()
    }

    /// Open a fresh session after an expiry, reusing the event channel.
    ///
    /// Must not be called while any lock the event consumer needs is held; the
    /// new session's `Connected` event is delivered through the same channel.
    pub fn reconnect(&self) {
        let mut session = self.session.lock();
        self.store.disconnect(*session);
        *session = self.store.connect(self.tx.clone());
    }

    /// Close the session. Ephemerals owned by it disappear immediately.
    pub fn disconnect(&self) {
        self.store.disconnect(*self.session.lock());
    }

    fn session(&self) -> SessionId {
        *self.session.lock()
    }

    pub fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store
            .create(self.session(), path, data, CreateMode::Persistent)
            .map(|_| ())
    }

    pub fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store
            .create(self.session(), path, data, CreateMode::Ephemeral)
            .map(|_| ())
    }

    /// Sequential create; returns the real path with the assigned suffix.
    pub fn create_sequential(&self, path: &str, data: &[u8]) -> Result<String> {
        self.store
            .create(self.session(), path, data, CreateMode::Sequential)
    }

    /// Ephemeral-sequential create; returns the real path.
    pub fn create_ephemeral_sequential(&self, path: &str, data: &[u8]) -> Result<String> {
        self.store
            .create(self.session(), path, data, CreateMode::EphemeralSequential)
    }

    /// Create the path if absent; an existing node is not an error.
    pub fn ensure_path(&self, path: &str) -> Result<()> {
        match self.create(path, b"") {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.store.delete(self.session(), path)
    }

    pub fn exists(&self, path: &str, watch: Watch) -> bool {
        match self.store.exists(self.session(), path, watch) {
            Ok(found) => found,
            Err(err) => {
                warn!("exists({}) failed: {}", path, err);
                false
            }
        }
    }

    pub fn get_data(&self, path: &str, watch: Watch) -> Result<Vec<u8>> {
        self.store.get_data(self.session(), path, watch)
    }

    /// Read and decode a KV payload in one step.
    pub fn get_payload(&self, path: &str, watch: Watch) -> Result<KvPayload> {
        Ok(KvPayload::parse(&self.get_data(path, watch)?))
    }

    pub fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store.set_data(self.session(), path, data)
    }

    pub fn get_children(&self, path: &str, watch: Watch) -> Result<Vec<String>> {
        self.store.get_children(self.session(), path, watch)
    }

    /// Children list that treats every failure as "no children", logging once.
    pub fn children_or_empty(&self, path: &str, watch: Watch) -> Vec<String> {
        match self.get_children(path, watch) {
            Ok(children) => children,
            Err(err) => {
                warn!("get_children({}) failed: {}", path, err);
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for CoordClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordClient")
            .field("session", &*self.session.lock())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Errors treated as "store unavailable" rather than logical failures.
pub fn is_transient(err: &Error) -> bool {
    matches!(
        err,
        Error::Coord(crate::CoordError::NotConnected)
            | Error::Coord(crate::CoordError::SessionExpired)
    )
}
