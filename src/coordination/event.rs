//! Events delivered by the coordination store to a session.

use std::fmt;

/// Session-level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session (re)connected to the coordination service.
    Connected,
    /// The session was expired; every ephemeral it owned is gone.
    Expired,
}

/// Path-level events, fired by one-shot watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEvent {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
}

/// An event delivered to a session's dispatch loop.
///
/// Path events for the same path are delivered in the order the store applied
/// the mutations; the consumer is expected to handle them serially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordEvent {
    Session(SessionEvent),
    Path { event: PathEvent, path: String },
}

impl fmt::Display for CoordEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordEvent::Session(s) => write!(f, "session {:?}", s),
            CoordEvent::Path { event, path } => write!(f, "{:?} {}", event, path),
        }
    }
}

/// Whether a read should leave a one-shot watch behind.
///
/// Every liveness-bearing read in the controller passes `Watch::Set` and
/// re-arms after each fire; plain lookups pass `Watch::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    Set,
    None,
}

impl Watch {
    pub fn is_set(self) -> bool {
        matches!(self, Watch::Set)
    }
}
