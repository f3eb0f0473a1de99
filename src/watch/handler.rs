use std::collections::HashMap;

use crate::Revision;

/// Point-in-time view of every key under a watched prefix.
///
/// Each delivery hands out its own copy, so a snapshot never changes after
/// it was received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    entries: HashMap<String, String>,
    revision: Revision,
}

impl DirectorySnapshot {
    pub fn new(
        entries: HashMap<String, String>,
        revision: Revision,
    ) -> Self {
        Self { entries, revision }
    }

    pub fn entries(&self) -> &HashMap<String, String> {
        &self.entries
    }

    pub fn into_entries(self) -> HashMap<String, String> {
        self.entries
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store revision this view reflects
    pub fn revision(&self) -> Revision {
        self.revision
    }
}

/// Receives the up-to-date content of a watched prefix.
///
/// Called from the watch task after every fully applied update. Calls for
/// one prefix never overlap; a slow handler delays the next update.
pub trait WatchHandler: Send + Sync + 'static {
    fn on_snapshot(
        &self,
        snapshot: DirectorySnapshot,
    );
}

impl<F> WatchHandler for F
where
    F: Fn(DirectorySnapshot) + Send + Sync + 'static,
{
    fn on_snapshot(
        &self,
        snapshot: DirectorySnapshot,
    ) {
        self(snapshot)
    }
}
