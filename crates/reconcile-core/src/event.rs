//! Watch events and the handler seam.
//!
//! The event kinds form a closed set; handlers match on [`ResourceEvent`]
//! exhaustively instead of looking callables up by a type string.

use async_trait::async_trait;

/// Error object delivered in-band on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchFault {
    /// HTTP-style status code
    pub code: u16,
    /// Machine readable reason, e.g. `Expired`
    pub reason: String,
    /// Human readable message
    pub message: String,
}

impl WatchFault {
    /// True when the server reports the resume cursor as too old.
    pub fn is_expired(&self) -> bool {
        self.code == 410 || self.reason == "Expired" || self.reason == "Gone"
    }
}

impl std::fmt::Display for WatchFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.code, self.reason, self.message)
    }
}

/// Raw event as received from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Object created
    Added(K),
    /// Object updated
    Modified(K),
    /// Object removed; carries its last state
    Deleted(K),
    /// Progress marker carrying only a resource version
    Bookmark(String),
    /// In-band error
    Error(WatchFault),
}

/// Event handed to an [`EventHandler`] after namespace filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<K> {
    /// `ADDED`
    Added(K),
    /// `MODIFIED`
    Modified(K),
    /// `DELETED`
    Deleted(K),
    /// `ERROR`
    Error(WatchFault),
}

impl<K> ResourceEvent<K> {
    /// Wire name of the event kind, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "ADDED",
            Self::Modified(_) => "MODIFIED",
            Self::Deleted(_) => "DELETED",
            Self::Error(_) => "ERROR",
        }
    }
}

/// Per-resource-kind reaction to watch events.
///
/// Handlers run inline on the owning watch loop, so a slow remote call
/// only delays further events of the same kind.
#[async_trait]
pub trait EventHandler<K>: Send + Sync
where
    K: Send + 'static,
{
    /// Reacts to a single event.
    async fn handle(&self, event: ResourceEvent<K>);

    /// Reacts to a full listing, taken at start-up and after the watch
    /// cursor expired. Events may have been missed in between, so the
    /// listing is the complete current state of the watched namespaces.
    async fn resync(&self, objects: Vec<K>) {
        for object in objects {
            self.handle(ResourceEvent::Modified(object)).await;
        }
    }
}
