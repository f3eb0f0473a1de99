use std::collections::HashMap;

use tracing::trace;

use super::DirectorySnapshot;
use crate::EventType;
use crate::KvEvent;
use crate::RangeSnapshot;
use crate::Revision;

/// Prefix content owned by one watch task.
///
/// A full read replaces everything and resets `revision` to the read's
/// revision; event batches only apply events newer than that.
#[derive(Debug, Default)]
pub(crate) struct DirectoryCache {
    entries: HashMap<String, String>,
    revision: Revision,
}

impl DirectoryCache {
    pub(crate) fn revision(&self) -> Revision {
        self.revision
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn replace(
        &mut self,
        snapshot: RangeSnapshot,
    ) {
        self.entries = snapshot
            .kvs
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect();
        self.revision = snapshot.revision;
    }

    /// Applies a batch in order. Returns whether any event was newer than the
    /// cache; stale events are skipped.
    pub(crate) fn apply(
        &mut self,
        events: &[KvEvent],
    ) -> bool {
        let floor = self.revision;
        let mut applied = false;

        for event in events {
            if event.kv.mod_revision <= floor {
                trace!(key = %event.kv.key, revision = event.kv.mod_revision, floor, "stale event skipped");
                continue;
            }
            match event.event_type {
                EventType::Put => {
                    self.entries.insert(event.kv.key.clone(), event.kv.value.clone());
                }
                EventType::Delete => {
                    self.entries.remove(&event.kv.key);
                }
            }
            self.revision = self.revision.max(event.kv.mod_revision);
            applied = true;
        }

        applied
    }

    /// Independent copy for delivery
    pub(crate) fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot::new(self.entries.clone(), self.revision)
    }
}
