//! Change-data-capture record handling
//!
//! Pure, stateless transformations applied to every inbound message:
//!
//! ```text
//! ChangeEnvelope ─► decode ─► ChangeRecord ─┬─► classify  ─┐
//!                                           ├─► address   ─┼─► AppendableEvent
//!                                           └─► correlate ─┘
//! ```

pub mod address;
pub mod classify;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod event;

pub use address::{PrimaryKeyMap, StreamAddressor, StreamId};
pub use classify::{classify, EventType};
pub use correlation::correlation_id;
pub use envelope::{decode, ChangeEnvelope, ChangeRecord, SourcePosition};
pub use error::{DecodeError, Document, LookupError, RecordError};
pub use event::{AppendableEvent, EventMetadata};

/// Run the whole per-message pipeline: target stream plus the event to append
pub fn prepare(
    envelope: &ChangeEnvelope,
    addressor: &StreamAddressor,
) -> Result<(StreamId, AppendableEvent), RecordError> {
    let record = decode(envelope, addressor)?;
    let stream = StreamId::new(&record.table, &record.primary_key_value);
    let event = AppendableEvent::from_record(&record);
    Ok((stream, event))
}
