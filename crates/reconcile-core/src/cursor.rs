//! Watch resume position.

/// Opaque resource version marking how far a watch has read.
///
/// An empty cursor means "no position": the loop has to list before it
/// can watch again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchCursor(String);

impl WatchCursor {
    /// Cursor positioned at the given resource version.
    pub fn at(resource_version: impl Into<String>) -> Self {
        Self(resource_version.into())
    }

    /// Moves the cursor to a newer resource version. Empty versions are
    /// ignored so a malformed event cannot reset the position.
    pub fn advance(&mut self, resource_version: &str) {
        if !resource_version.is_empty() {
            resource_version.clone_into(&mut self.0);
        }
    }

    /// Drops the position after the server rejected it as too old.
    pub fn expire(&mut self) {
        self.0.clear();
    }

    /// True when there is no position to resume from.
    pub fn is_expired(&self) -> bool {
        self.0.is_empty()
    }

    /// Resource version to pass to the watch call.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
