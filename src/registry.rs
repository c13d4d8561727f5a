use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::info;

use crate::db::{models::Device, Store, StoreError};

#[derive(Debug, Error)]
#[error("failed to load topic registry: {0}")]
pub struct RegistryLoadError(#[from] pub StoreError);

/// Immutable `topic -> device id` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSnapshot {
    by_topic: HashMap<String, i32>,
}

impl TopicSnapshot {
    pub fn from_devices<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Self {
        devices
            .into_iter()
            .map(|d| (d.topic.clone(), d.id))
            .collect()
    }

    /// Look up the device owning `topic`. `None` means the topic is unmapped.
    pub fn resolve(&self, topic: &str) -> Option<i32> {
        self.by_topic.get(topic).copied()
    }

    /// Topics in sorted order.
    pub fn topics(&self) -> BTreeSet<&str> {
        self.by_topic.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}

impl FromIterator<(String, i32)> for TopicSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, i32)>>(iter: I) -> Self {
        Self {
            by_topic: iter.into_iter().collect(),
        }
    }
}

/// Topics gained and lost by a reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn between(old: &TopicSnapshot, new: &TopicSnapshot) -> Self {
        let old_topics = old.topics();
        let new_topics = new.topics();
        Self {
            added: new_topics
                .difference(&old_topics)
                .map(|t| (*t).to_owned())
                .collect(),
            removed: old_topics
                .difference(&new_topics)
                .map(|t| (*t).to_owned())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Shared, reloadable view of which topics map to which active devices.
///
/// Readers get a consistent snapshot without locking; `reload` builds a new
/// snapshot from the store and swaps it in atomically.
#[derive(Debug)]
pub struct TopicRegistry {
    current: ArcSwap<TopicSnapshot>,
}

impl TopicRegistry {
    pub fn new(snapshot: TopicSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Build a snapshot from the active devices in the store.
    pub async fn load(store: &Store) -> Result<TopicSnapshot, RegistryLoadError> {
        let devices = store.query_devices(true).await?;
        let snapshot = TopicSnapshot::from_devices(&devices);
        info!(topics = snapshot.len(), "Retrieved device topics from store");
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Arc<TopicSnapshot> {
        self.current.load_full()
    }

    pub fn resolve(&self, topic: &str) -> Option<i32> {
        self.current.load().resolve(topic)
    }

    /// Replace the snapshot, returning what changed.
    pub fn replace(&self, snapshot: TopicSnapshot) -> SnapshotDiff {
        let new = Arc::new(snapshot);
        let old = self.current.swap(Arc::clone(&new));
        SnapshotDiff::between(&old, &new)
    }

    /// Reload from the store. On failure the current snapshot stays in place.
    pub async fn reload(&self, store: &Store) -> Result<SnapshotDiff, RegistryLoadError> {
        let snapshot = Self::load(store).await?;
        let diff = self.replace(snapshot);
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Topic registry reloaded"
        );
        Ok(diff)
    }
}
