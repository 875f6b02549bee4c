//! Coordination service access.
//!
//! The cluster coordinates through a hierarchical, ephemeral-znode,
//! watch-driven store. This module provides the typed client wrapper the rest
//! of the crate uses, the namespace layout, the key=value payload codec, and
//! an in-process store implementation that doubles as the dev/test backend.

mod client;
mod event;
mod paths;
pub mod payload;
mod store;

pub use client::{is_transient, CoordClient};
pub use event::{CoordEvent, PathEvent, SessionEvent, Watch};
pub use paths::ClusterPaths;
pub use payload::KvPayload;
pub use store::{CreateMode, MemoryCoordStore, SessionId};
