//! Operation classifier: raw operation code -> semantic event type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Semantic event type written as the event's type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    Insert,
    Update,
    Delete,
    /// Row state from the initial bulk load, not from a live transaction
    Snapshot,
    Other,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Insert,
        EventType::Update,
        EventType::Delete,
        EventType::Snapshot,
        EventType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "Insert",
            EventType::Update => "Update",
            EventType::Delete => "Delete",
            EventType::Snapshot => "Snapshot",
            EventType::Other => "Other",
        }
    }

    /// Whether events of this type belong to a source transaction.
    /// Snapshot events come from the initial load and never do.
    pub fn has_transaction_grouping(&self) -> bool {
        !matches!(self, EventType::Snapshot)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// Total mapping from operation code to event type. Unknown codes become
/// `Other` so an unrecognised code never stalls the pipeline.
pub fn classify(op: &str) -> EventType {
    match op {
        "c" => EventType::Insert,
        "u" => EventType::Update,
        "d" => EventType::Delete,
        "r" => EventType::Snapshot,
        _ => EventType::Other,
    }
}
