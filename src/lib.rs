pub mod bridge;
pub mod buggify;
pub mod cdc;
pub mod config;
pub mod dst;
pub mod event_log;
pub mod io;
pub mod observability;
pub mod source;

pub use bridge::{Bridge, BridgeError, BridgeOptions, BridgeStats, DeadLetterQueue, RetryPolicy, Step};
pub use cdc::{ChangeEnvelope, ChangeRecord, EventType, PrimaryKeyMap, SourcePosition, StreamAddressor, StreamId};
pub use config::{BridgeConfig, ConfigError};
pub use event_log::{EventLog, EventLogError, ExpectedVersion, InMemoryEventLog, RecordedEvent};
pub use source::{InMemorySource, MessageSource, SourceError};
