#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **corestream-types** – Shared primitives for the `corestream` workspace.
//!
//! This crate sits at the bottom of the dependency graph: positions, event
//! keys, the event envelope, and the crate-wide error type. It makes no
//! assumptions about storage, encryption, or transport so that every other
//! `corestream-*` crate can depend on it without cycles.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier assigned to every committed event (UUIDv7, time-ordered).
pub type EventId = Uuid;

/// 32-byte blake3 digest of a logical key, used for store partitioning and
/// as the encryption scope handed to a `KeyProvider`.
pub type EventKey = [u8; 32];

/// Monotonic, dense, 1-based position of an event within a stream.
///
/// `Position(0)` is [`Position::START`]; [`Position::END`] is the sentinel
/// meaning "skip everything present at subscription time".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(pub u64);

impl Position {
    /// The position before any event has been written.
    pub const START: Position = Position(0);

    /// Sentinel requesting delivery of only events appended after
    /// subscription time.
    pub const END: Position = Position(u64::MAX);

    /// Encode as little-endian bytes, matching the on-disk checkpoint format.
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decode from little-endian bytes, matching the on-disk checkpoint format.
    pub fn from_le_bytes(bytes: [u8; 8]) -> Position {
        Position(u64::from_le_bytes(bytes))
    }

    /// The next dense position after this one.
    pub fn next(self) -> Position {
        Position(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of mutation an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// A new logical record was created.
    Created,
    /// An existing logical record was replaced.
    Updated,
    /// A logical record was removed.
    Deleted,
}

/// A not-yet-positioned event, as constructed by a caller before it is
/// appended to a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    /// Created, Updated, or Deleted.
    pub event_type: EventType,
    /// Application-defined payload kind, e.g. `"orders"`.
    pub data_type: String,
    /// Schema version of `payload`.
    pub version: String,
    /// Hash of the logical id; scopes partitioning and encryption.
    pub key: EventKey,
    /// Opaque payload bytes (plaintext at this layer; the stream layer
    /// encrypts before handing to the store).
    pub payload: Vec<u8>,
}

/// An immutable, positioned event as read back from a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Dense monotonic position assigned at append time.
    pub position: Position,
    /// Wall-clock timestamp assigned at append time.
    pub created: DateTime<Utc>,
    /// Created, Updated, or Deleted.
    pub event_type: EventType,
    /// Application-defined payload kind.
    pub data_type: String,
    /// Schema version of `payload`.
    pub version: String,
    /// Hash of the logical id.
    pub key: EventKey,
    /// Opaque payload bytes, as stored (ciphertext if encrypted).
    pub payload: Vec<u8>,
}

impl Event {
    /// Split an appended event back into its caller-supplied shape plus the
    /// position/timestamp the store assigned.
    pub fn into_new(self) -> (NewEvent, Position, DateTime<Utc>) {
        (
            NewEvent {
                event_type: self.event_type,
                data_type: self.data_type,
                version: self.version,
                key: self.key,
                payload: self.payload,
            },
            self.position,
            self.created,
        )
    }
}

/// The outcome of a single append, delivered on a write's status channel.
#[derive(Debug, Clone, Copy)]
pub struct Written {
    /// The timestamp the writer assigned.
    pub time: DateTime<Utc>,
    /// The position the writer assigned.
    pub position: Position,
}

/// Crate-wide error type threaded up from every `corestream-*` layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A logical record does not exist (`Map::get`/`delete`).
    #[error("key not found")]
    KeyNotFound,
    /// Payload serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),
    /// Payload deserialization failed.
    #[error("decode failed: {0}")]
    Decode(String),
    /// Underlying file or KV-store I/O failed.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A blocking call was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
    /// A competing-consumer lease expired before the event was acknowledged.
    #[error("lease lost")]
    LeaseLost,
    /// AEAD encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),
    /// The embedded KV engine reported an error.
    #[error("storage engine error: {0}")]
    Store(String),
}

/// Convenience alias for `Result<T, corestream_types::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Compute the blake3 digest used as an [`EventKey`] from a logical id.
pub fn hash_key(logical_id: &str) -> EventKey {
    blake3::hash(logical_id.as_bytes()).into()
}
