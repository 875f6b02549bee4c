//! In-process coordination store.
//!
//! This implementation keeps the full hierarchical znode tree in memory and is
//! suitable for development, testing, and single-process deployments. It is
//! also the reference semantics for the client wrapper: ephemerals die with
//! their session, sequential creates get a monotonic zero-padded suffix, and
//! watches are one-shot per session.
//!
//! Mutations and watch firing happen under one lock, and events are pushed into
//! each session's unbounded channel before the lock is released, so a session
//! observes events for any single path in mutation order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::event::{CoordEvent, PathEvent, SessionEvent, Watch};
use crate::{CoordError, Result};

/// Identifier of one store session.
pub type SessionId = u64;

/// Creation mode for a znode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    Sequential,
    EphemeralSequential,
}

impl CreateMode {
    fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    fn is_sequential(self) -> bool {
        matches!(self, CreateMode::Sequential | CreateMode::EphemeralSequential)
    }
}

#[derive(Debug)]
struct Znode {
    data: Vec<u8>,
    /// Owning session for ephemerals, `None` for persistent nodes.
    owner: Option<SessionId>,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Znode>,
    /// Per-prefix counters for sequential creates.
    sequence: HashMap<String, u64>,
    /// One-shot watches armed on a specific path (exists/data watches).
    path_watches: HashMap<String, Vec<SessionId>>,
    /// One-shot watches armed on a parent's child set.
    child_watches: HashMap<String, Vec<SessionId>>,
}

struct SessionHandle {
    tx: UnboundedSender<CoordEvent>,
    alive: bool,
}

/// In-memory hierarchical znode store with sessions and watches.
pub struct MemoryCoordStore {
    tree: Mutex<Tree>,
    sessions: DashMap<SessionId, SessionHandle>,
    next_session: AtomicU64,
}

impl Default for MemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Tree::default()),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
        }
    }

    /// Open a session, delivering its events into `tx`.
    ///
    /// The session is registered before its `Connected` event is queued, so a
    /// consumer reacting to the event can immediately issue calls on it.
    pub fn connect(&self, tx: UnboundedSender<CoordEvent>) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            SessionHandle {
                tx: tx.clone(),
                alive: true,
            },
        );
        let _ = tx.send(CoordEvent::Session(SessionEvent::Connected));
        debug!("coordination session {} connected", id);
        id
    }

    /// True while the session has not been expired or disconnected.
    pub fn is_alive(&self, session: SessionId) -> bool {
        self.sessions.get(&session).map(|h| h.alive).unwrap_or(false)
    }

    /// Expire a session: drop its ephemerals (firing the same watches a delete
    /// would) and deliver `SessionEvent::Expired` on its channel.
    pub fn expire_session(&self, session: SessionId) {
        if let Some(mut handle) = self.sessions.get_mut(&session) {
            if !handle.alive {
                return;
            }
            handle.alive = false;
        } else {
            return;
        }
        self.purge_ephemerals(session);
        if let Some(handle) = self.sessions.get(&session) {
            let _ = handle.tx.send(CoordEvent::Session(SessionEvent::Expired));
        }
        debug!("coordination session {} expired", session);
    }

    /// Close a session without delivering an expiry event.
    pub fn disconnect(&self, session: SessionId) {
        if self.sessions.remove(&session).is_some() {
            self.purge_ephemerals(session);
            debug!("coordination session {} disconnected", session);
        }
    }

    pub fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        self.check_session(session)?;
        debug_assert!(path.starts_with('/') && !path.ends_with('/'));

        let mut tree = self.tree.lock();
        let real_path = if mode.is_sequential() {
            let counter = tree.sequence.entry(path.to_string()).or_insert(0);
            let real = format!("{}{:010}", path, *counter);
            *counter += 1;
            real
        } else {
            path.to_string()
        };

        if tree.nodes.contains_key(&real_path) {
            return Err(CoordError::NodeExists.into());
        }
        let parent = parent_of(&real_path);
        if !parent.is_empty() && !tree.nodes.contains_key(parent) {
            return Err(CoordError::NoNode.into());
        }

        let owner = mode.is_ephemeral().then_some(session);
        tree.nodes.insert(
            real_path.clone(),
            Znode {
                data: data.to_vec(),
                owner,
            },
        );
        self.fire_path_watch(&mut tree, &real_path, PathEvent::Created);
        let parent = parent_of(&real_path).to_string();
        self.fire_child_watch(&mut tree, &parent);
        Ok(real_path)
    }

    pub fn delete(&self, session: SessionId, path: &str) -> Result<()> {
        self.check_session(session)?;
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(CoordError::NoNode.into());
        }
        if has_children(&tree.nodes, path) {
            return Err(CoordError::NotEmpty.into());
        }
        tree.nodes.remove(path);
        self.fire_path_watch(&mut tree, path, PathEvent::Deleted);
        let parent = parent_of(path).to_string();
        self.fire_child_watch(&mut tree, &parent);
        Ok(())
    }

    /// Check existence; `Watch::Set` arms a one-shot watch whether or not the
    /// path currently exists, so creation of an absent path still fires.
    pub fn exists(&self, session: SessionId, path: &str, watch: Watch) -> Result<bool> {
        self.check_session(session)?;
        let mut tree = self.tree.lock();
        if watch.is_set() {
            arm(&mut tree.path_watches, path, session);
        }
        Ok(tree.nodes.contains_key(path))
    }

    /// Read data. The watch is only armed when the node exists; callers that
    /// need creation notification for an absent path arm it via [`exists`].
    ///
    /// [`exists`]: MemoryCoordStore::exists
    pub fn get_data(&self, session: SessionId, path: &str, watch: Watch) -> Result<Vec<u8>> {
        self.check_session(session)?;
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(CoordError::NoNode.into());
        }
        if watch.is_set() {
            arm(&mut tree.path_watches, path, session);
        }
        Ok(tree.nodes.get(path).map(|z| z.data.clone()).unwrap_or_default())
    }

    pub fn set_data(&self, session: SessionId, path: &str, data: &[u8]) -> Result<()> {
        self.check_session(session)?;
        let mut tree = self.tree.lock();
        match tree.nodes.get_mut(path) {
            Some(znode) => znode.data = data.to_vec(),
            None => return Err(CoordError::NoNode.into()),
        }
        self.fire_path_watch(&mut tree, path, PathEvent::DataChanged);
        Ok(())
    }

    /// List direct children as full paths in lexicographic order (sequence
    /// order for sequential siblings sharing a prefix).
    ///
    /// An absent parent yields an empty list; with `Watch::Set` the watch is
    /// then armed on the parent path itself so its creation fires.
    pub fn get_children(&self, session: SessionId, path: &str, watch: Watch) -> Result<Vec<String>> {
        self.check_session(session)?;
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(path) {
            if watch.is_set() {
                arm(&mut tree.path_watches, path, session);
            }
            return Ok(Vec::new());
        }
        if watch.is_set() {
            arm(&mut tree.child_watches, path, session);
        }
        Ok(children_of(&tree.nodes, path))
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        match self.sessions.get(&session) {
            Some(handle) if handle.alive => Ok(()),
            Some(_) => Err(CoordError::SessionExpired.into()),
            None => Err(CoordError::NotConnected.into()),
        }
    }

    fn purge_ephemerals(&self, session: SessionId) {
        let mut tree = self.tree.lock();
        let doomed: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, z)| z.owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in doomed {
            tree.nodes.remove(&path);
            self.fire_path_watch(&mut tree, &path, PathEvent::Deleted);
            let parent = parent_of(&path).to_string();
            self.fire_child_watch(&mut tree, &parent);
        }
    }

    fn fire_path_watch(&self, tree: &mut Tree, path: &str, event: PathEvent) {
        if let Some(watchers) = tree.path_watches.remove(path) {
            self.deliver(&watchers, CoordEvent::Path {
                event,
                path: path.to_string(),
            });
        }
    }

    fn fire_child_watch(&self, tree: &mut Tree, parent: &str) {
        if parent.is_empty() {
            return;
        }
        if let Some(watchers) = tree.child_watches.remove(parent) {
            self.deliver(&watchers, CoordEvent::Path {
                event: PathEvent::ChildrenChanged,
                path: parent.to_string(),
            });
        }
    }

    fn deliver(&self, watchers: &[SessionId], event: CoordEvent) {
        for session in watchers {
            if let Some(handle) = self.sessions.get(session) {
                if handle.alive {
                    let _ = handle.tx.send(event.clone());
                }
            }
        }
    }
}

fn arm(watches: &mut HashMap<String, Vec<SessionId>>, path: &str, session: SessionId) {
    let list = watches.entry(path.to_string()).or_default();
    if !list.contains(&session) {
        list.push(session);
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

fn has_children(nodes: &BTreeMap<String, Znode>, path: &str) -> bool {
    let prefix = format!("{}/", path);
    nodes
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(p, _)| p.starts_with(&prefix))
}

fn children_of(nodes: &BTreeMap<String, Znode>, path: &str) -> Vec<String> {
    let prefix = format!("{}/", path);
    nodes
        .range(prefix.clone()..)
        .take_while(|(p, _)| p.starts_with(&prefix))
        .filter(|(p, _)| !p[prefix.len()..].contains('/'))
        .map(|(p, _)| p.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn store_with_session() -> (
        MemoryCoordStore,
        SessionId,
        mpsc::UnboundedReceiver<CoordEvent>,
    ) {
        let store = MemoryCoordStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = store.connect(tx);
        (store, session, rx)
    }

    #[test]
    fn create_requires_parent() {
        let (store, s, _rx) = store_with_session();
        let err = store
            .create(s, "/a/b", b"", CreateMode::Persistent)
            .unwrap_err();
        assert!(matches!(err, crate::Error::Coord(CoordError::NoNode)));

        store.create(s, "/a", b"", CreateMode::Persistent).unwrap();
        store.create(s, "/a/b", b"", CreateMode::Persistent).unwrap();
    }

    #[test]
    fn duplicate_create_is_node_exists() {
        let (store, s, _rx) = store_with_session();
        store.create(s, "/a", b"", CreateMode::Persistent).unwrap();
        let err = store
            .create(s, "/a", b"", CreateMode::Persistent)
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn sequential_paths_are_ordered() {
        let (store, s, _rx) = store_with_session();
        store.create(s, "/q", b"", CreateMode::Persistent).unwrap();
        let first = store
            .create(s, "/q/req", b"1", CreateMode::EphemeralSequential)
            .unwrap();
        let second = store
            .create(s, "/q/req", b"2", CreateMode::EphemeralSequential)
            .unwrap();
        assert_eq!(first, "/q/req0000000000");
        assert_eq!(second, "/q/req0000000001");
        assert_eq!(store.get_children(s, "/q", Watch::None).unwrap(), vec![
            first, second
        ]);
    }

    #[test]
    fn session_expiry_drops_ephemerals_and_fires_watches() {
        let (store, owner, _owner_rx) = store_with_session();
        let (tx, mut watcher_rx) = mpsc::unbounded_channel();
        let watcher = store.connect(tx);
        // drain the Connected event
        assert!(matches!(
            watcher_rx.try_recv().unwrap(),
            CoordEvent::Session(SessionEvent::Connected)
        ));

        store.create(owner, "/t", b"", CreateMode::Persistent).unwrap();
        store
            .create(owner, "/t/n", b"", CreateMode::Ephemeral)
            .unwrap();
        assert!(store.exists(watcher, "/t/n", Watch::Set).unwrap());

        store.expire_session(owner);
        assert!(!store.exists(watcher, "/t/n", Watch::None).unwrap());
        assert_eq!(watcher_rx.try_recv().unwrap(), CoordEvent::Path {
            event: PathEvent::Deleted,
            path: "/t/n".to_string(),
        });
        // expired session rejects further calls
        assert!(store.exists(owner, "/t", Watch::None).is_err());
    }

    #[test]
    fn watches_are_one_shot() {
        let (store, s, mut rx) = store_with_session();
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoordEvent::Session(SessionEvent::Connected)
        ));
        store.create(s, "/w", b"", CreateMode::Persistent).unwrap();
        store.get_data(s, "/w", Watch::Set).unwrap();

        store.set_data(s, "/w", b"x").unwrap();
        store.set_data(s, "/w", b"y").unwrap();

        assert_eq!(rx.try_recv().unwrap(), CoordEvent::Path {
            event: PathEvent::DataChanged,
            path: "/w".to_string(),
        });
        assert!(rx.try_recv().is_err(), "second change must not fire");
    }

    #[test]
    fn children_change_fires_parent_watch() {
        let (store, s, mut rx) = store_with_session();
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoordEvent::Session(SessionEvent::Connected)
        ));
        store.create(s, "/p", b"", CreateMode::Persistent).unwrap();
        store.get_children(s, "/p", Watch::Set).unwrap();
        store.create(s, "/p/c", b"", CreateMode::Persistent).unwrap();
        assert_eq!(rx.try_recv().unwrap(), CoordEvent::Path {
            event: PathEvent::ChildrenChanged,
            path: "/p".to_string(),
        });
    }

    #[test]
    fn delete_refuses_non_empty() {
        let (store, s, _rx) = store_with_session();
        store.create(s, "/p", b"", CreateMode::Persistent).unwrap();
        store.create(s, "/p/c", b"", CreateMode::Persistent).unwrap();
        let err = store.delete(s, "/p").unwrap_err();
        assert!(matches!(err, crate::Error::Coord(CoordError::NotEmpty)));
        store.delete(s, "/p/c").unwrap();
        store.delete(s, "/p").unwrap();
    }

    #[test]
    fn grandchildren_are_not_children() {
        let (store, s, _rx) = store_with_session();
        store.create(s, "/p", b"", CreateMode::Persistent).unwrap();
        store.create(s, "/p/a", b"", CreateMode::Persistent).unwrap();
        store.create(s, "/p/a/x", b"", CreateMode::Persistent).unwrap();
        assert_eq!(store.get_children(s, "/p", Watch::None).unwrap(), vec![
            "/p/a".to_string()
        ]);
    }
}
