//! Committed offset persistence
//!
//! One JSON file per consumer group: `<offset_dir>/<group_id>.json`,
//! mapping topic -> partition -> next offset to read. Writes go to a
//! temporary file that is then renamed over the old one.

use super::{SourceError, SourcePosition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Next offset to read per (topic, partition)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommittedOffsets {
    topics: BTreeMap<String, BTreeMap<i32, i64>>,
}

impl CommittedOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where to resume `(topic, partition)`, if anything was committed
    pub fn next_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.topics.get(topic)?.get(&partition).copied()
    }

    /// Record `position` as processed. Never moves an offset backwards.
    pub fn commit(&mut self, position: &SourcePosition) {
        let next = position.offset + 1;
        let slot = self
            .topics
            .entry(position.topic.clone())
            .or_default()
            .entry(position.partition)
            .or_insert(next);
        if next > *slot {
            *slot = next;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    pub fn new(dir: &Path, group_id: &str) -> Self {
        OffsetStore {
            path: dir.join(format!("{}.json", group_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load committed offsets; a missing file means nothing was committed
    pub fn load(&self) -> Result<CommittedOffsets, SourceError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SourceError::OffsetStore(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CommittedOffsets::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, offsets: &CommittedOffsets) -> Result<(), SourceError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(offsets)
            .map_err(|e| SourceError::OffsetStore(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
