//! Core domain models, error taxonomy and content hashing.
//!
//! Provides the strongly-typed primitives shared by the event store and the
//! integration client: event and processing-log records, the outcome of a
//! downstream call, the canonical-JSON event hasher, and an injectable clock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod hashing;
pub mod models;
pub mod outcome;
pub mod time;

pub use error::{Error, Result};
pub use hashing::{canonical_json, event_hash, to_event_data};
pub use models::{
    BulkInsertResult, Event, EventHash, EventId, HashTable, LogFields, LogId, NewEvent,
    ProcessingLog, ProcessingStatus, RetryCandidate, RetryState,
};
pub use outcome::{CallStatus, ProcessingOutcome, Provenance};
pub use time::{Clock, RealClock, TestClock};
