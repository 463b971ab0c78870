#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **corestream-map** – Event-sourced materialized map (component D): a
//! `sled`-backed projection of a stream, kept current by a
//! [`corestream_apply`] set-helper loop.
//!
//! Every mutation goes out as an event (`set`/`delete`), round-trips through
//! the apply loop, and only then is visible to readers — including on the
//! node that issued it, via `set_and_wait`. Keys and their live payloads are
//! held in separate `sled` trees, so listing keys or checking existence never
//! needs prefix filtering and never touches a payload it isn't looking for.
//! A `checkpoint` tree persists the last applied position so a restart
//! resumes the apply loop instead of replaying the whole stream.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use corestream_apply::{Applier, SetHelper};
use corestream_stream::{Stream, TypedEvent};
use corestream_types::{Error, EventType, Position, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, Transactional};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CHECKPOINT_KEY: &[u8] = b"position";

/// Configuration for an [`EventMap`].
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Application-defined payload kind published for every mutation.
    pub data_type: String,
    /// Schema version of the payload.
    pub version: String,
    /// Directory backing the `sled` database.
    pub sled_dir: PathBuf,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            data_type: String::new(),
            version: "1.0.0".into(),
            sled_dir: PathBuf::from("."),
        }
    }
}

impl MapConfig {
    /// Build a config for `data_type`, backed by `sled_dir`, with the
    /// version at its default (`"1.0.0"`).
    pub fn new(data_type: impl Into<String>, sled_dir: impl Into<PathBuf>) -> Self {
        MapConfig {
            data_type: data_type.into(),
            sled_dir: sled_dir.into(),
            ..Default::default()
        }
    }

    /// Override the schema version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// The wire envelope published to the stream for every map mutation.
///
/// `payload` is `Some` for creates/updates and `None` for deletes; `id` is a
/// fresh UUIDv7 minted by the writer so every replica's `payloads` tree uses
/// the same key, and `previous_id` names the payload row to reclaim on an
/// update.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MapEvent<T, M> {
    key: String,
    id: Uuid,
    previous_id: Option<Uuid>,
    metadata: M,
    payload: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry<M> {
    id: Uuid,
    metadata: M,
}

/// An event-sourced, materialized map over `T` values, each tagged with
/// caller metadata `M`.
#[derive(Clone)]
pub struct EventMap<T, M> {
    index: sled::Tree,
    payloads: sled::Tree,
    checkpoint: sled::Tree,
    helper: SetHelper<MapEvent<T, M>>,
    data_type: String,
    version: String,
}

impl<T, M> EventMap<T, M>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (or recover) the map backed by `config.sled_dir`, replaying
    /// `stream` from the last persisted checkpoint.
    pub async fn open(config: MapConfig, stream: Stream, cancel: CancellationToken) -> Result<EventMap<T, M>> {
        let MapConfig { data_type, version, sled_dir } = config;
        let db = sled::open(&sled_dir).map_err(|e| Error::Store(e.to_string()))?;
        let index = db.open_tree("index").map_err(|e| Error::Store(e.to_string()))?;
        let payloads = db.open_tree("payloads").map_err(|e| Error::Store(e.to_string()))?;
        let checkpoint = db.open_tree("checkpoint").map_err(|e| Error::Store(e.to_string()))?;

        let from = checkpoint
            .get(CHECKPOINT_KEY)
            .map_err(|e| Error::Store(e.to_string()))?
            .map(|bytes| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Position::from_le_bytes(buf)
            })
            .unwrap_or(Position::START);

        let applier = Arc::new(MapApplier::<T, M> {
            index: index.clone(),
            payloads: payloads.clone(),
            checkpoint: checkpoint.clone(),
            _marker: std::marker::PhantomData,
        });

        let typed_stream = stream.typed::<MapEvent<T, M>>();
        let helper = SetHelper::spawn(typed_stream, applier, from, cancel);

        Ok(EventMap {
            index,
            payloads,
            checkpoint,
            helper,
            data_type,
            version,
        })
    }

    /// Fetch the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<T> {
        let entry = self.load_index(key)?;
        self.load_payload(entry.id)
    }

    /// Whether `key` currently has a value.
    pub fn exists(&self, key: &str) -> Result<bool> {
        self.index
            .contains_key(key)
            .map_err(|e| Error::Store(e.to_string()))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the map currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All live keys. Unlike a shared-namespace store, `index` never holds
    /// anything but map keys, so no prefix filtering is needed.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.index
            .iter()
            .keys()
            .map(|k| {
                let bytes = k.map_err(|e| Error::Store(e.to_string()))?;
                String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decode(e.to_string()))
            })
            .collect()
    }

    /// Visit every live entry in key order, stopping early if `f` returns
    /// `false`.
    pub fn range<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &T) -> bool,
    {
        for item in self.index.iter() {
            let (key_bytes, entry_bytes) = item.map_err(|e| Error::Store(e.to_string()))?;
            let key = String::from_utf8(key_bytes.to_vec()).map_err(|e| Error::Decode(e.to_string()))?;
            let entry: IndexEntry<M> =
                rmp_serde::from_slice(&entry_bytes).map_err(|e| Error::Decode(e.to_string()))?;
            let value = self.load_payload(entry.id)?;
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    /// Create or replace the value at `key`.
    pub async fn set(&self, key: impl Into<String>, metadata: M, data: T) -> Result<()> {
        let key = key.into();
        let existing = self.load_index(&key).ok();
        let previous_id = existing.as_ref().map(|e| e.id);
        let id = Uuid::now_v7();
        let event_type = if existing.is_some() {
            EventType::Updated
        } else {
            EventType::Created
        };

        // Written locally first so this node's readers see it immediately,
        // without waiting on the round trip through the apply loop (which
        // will harmlessly write the same bytes again when it processes the
        // event this `set` is about to publish).
        let bytes = rmp_serde::to_vec(&data).map_err(|e| Error::Encode(e.to_string()))?;
        self.payloads
            .insert(id.as_bytes(), bytes)
            .map_err(|e| Error::Store(e.to_string()))?;

        let key_hash = corestream_types::hash_key(&key);
        let envelope = MapEvent {
            key,
            id,
            previous_id,
            metadata,
            payload: Some(data),
        };
        self.helper
            .set_and_wait(event_type, self.data_type.clone(), self.version.clone(), key_hash, &envelope)
            .await
    }

    /// Remove the value at `key`, as derived from `data` the same way `set`
    /// derived it when the value was written.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let existing = self.load_index(key)?;
        let key_hash = corestream_types::hash_key(key);
        let envelope = MapEvent {
            key: key.to_string(),
            id: existing.id,
            previous_id: Some(existing.id),
            metadata: existing.metadata,
            payload: None,
        };
        self.helper
            .set_and_wait(EventType::Deleted, self.data_type.clone(), self.version.clone(), key_hash, &envelope)
            .await
    }

    /// Best-effort snapshot of the last persisted checkpoint.
    pub fn checkpoint(&self) -> Position {
        self.checkpoint
            .get(CHECKPOINT_KEY)
            .ok()
            .flatten()
            .map(|bytes| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Position::from_le_bytes(buf)
            })
            .unwrap_or(Position::START)
    }

    fn load_index(&self, key: &str) -> Result<IndexEntry<M>> {
        let bytes = self
            .index
            .get(key)
            .map_err(|e| Error::Store(e.to_string()))?
            .ok_or(Error::KeyNotFound)?;
        rmp_serde::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    fn load_payload(&self, id: Uuid) -> Result<T> {
        let bytes = self
            .payloads
            .get(id.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))?
            .ok_or(Error::KeyNotFound)?;
        rmp_serde::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

struct MapApplier<T, M> {
    index: sled::Tree,
    payloads: sled::Tree,
    checkpoint: sled::Tree,
    _marker: std::marker::PhantomData<(T, M)>,
}

#[async_trait]
impl<T, M> Applier<MapEvent<T, M>> for MapApplier<T, M>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn on_upsert(&self, event: &TypedEvent<MapEvent<T, M>>) -> Result<()> {
        let envelope = &event.data;
        let index_bytes = rmp_serde::to_vec(&IndexEntry {
            id: envelope.id,
            metadata: envelope.metadata.clone(),
        })
        .map_err(|e| Error::Encode(e.to_string()))?;
        let payload_bytes = match &envelope.payload {
            Some(payload) => Some(rmp_serde::to_vec(payload).map_err(|e| Error::Encode(e.to_string()))?),
            None => None,
        };
        let position = event.position.to_le_bytes().to_vec();
        let previous_id = envelope.previous_id.filter(|prev| *prev != envelope.id);

        (&self.payloads, &self.index, &self.checkpoint)
            .transaction(|(payloads, index, checkpoint)| {
                if let Some(bytes) = &payload_bytes {
                    payloads.insert(envelope.id.as_bytes(), bytes.clone())?;
                }
                if let Some(prev) = previous_id {
                    payloads.remove(prev.as_bytes())?;
                }
                index.insert(envelope.key.as_bytes(), index_bytes.clone())?;
                checkpoint.insert(CHECKPOINT_KEY, position.clone())?;
                Ok::<(), ConflictableTransactionError<sled::Error>>(())
            })
            .map_err(|e| Error::Store(e.to_string()))
    }

    async fn on_delete(&self, event: &TypedEvent<MapEvent<T, M>>) -> Result<()> {
        let envelope = &event.data;
        let position = event.position.to_le_bytes().to_vec();

        (&self.payloads, &self.index, &self.checkpoint)
            .transaction(|(payloads, index, checkpoint)| {
                payloads.remove(envelope.id.as_bytes())?;
                index.remove(envelope.key.as_bytes())?;
                checkpoint.insert(CHECKPOINT_KEY, position.clone())?;
                Ok::<(), ConflictableTransactionError<sled::Error>>(())
            })
            .map_err(|e| Error::Store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corestream_store::{EventStore, StoreConfig};
    use corestream_stream::NoEncryption;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Order {
        total_cents: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
    struct OrderMeta {
        region: String,
    }

    async fn open_map(dir: &std::path::Path) -> EventMap<Order, OrderMeta> {
        let store = EventStore::open("orders", StoreConfig::new(dir.join("stream")).without_fsync())
            .await
            .unwrap();
        let stream = Stream::new(store, Arc::new(NoEncryption));
        let config = MapConfig::new("orders", dir.join("map"));
        EventMap::open(config, stream, CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(dir.path()).await;
        map.set("o-1", OrderMeta { region: "eu".into() }, Order { total_cents: 500 })
            .await
            .unwrap();

        assert!(map.exists("o-1").unwrap());
        assert_eq!(map.get("o-1").unwrap(), Order { total_cents: 500 });
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn exists_is_false_for_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(dir.path()).await;
        assert!(!map.exists("missing").unwrap());
    }

    #[tokio::test]
    async fn update_reclaims_previous_payload() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(dir.path()).await;
        map.set("o-2", OrderMeta::default(), Order { total_cents: 100 })
            .await
            .unwrap();
        map.set("o-2", OrderMeta::default(), Order { total_cents: 200 })
            .await
            .unwrap();

        assert_eq!(map.get("o-2").unwrap(), Order { total_cents: 200 });
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(dir.path()).await;
        map.set("o-3", OrderMeta::default(), Order { total_cents: 50 })
            .await
            .unwrap();
        map.delete("o-3").await.unwrap();

        assert!(!map.exists("o-3").unwrap());
        assert!(map.get("o-3").is_err());
    }

    #[tokio::test]
    async fn keys_lists_only_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(dir.path()).await;
        map.set("o-4", OrderMeta::default(), Order { total_cents: 1 })
            .await
            .unwrap();
        map.set("o-5", OrderMeta::default(), Order { total_cents: 2 })
            .await
            .unwrap();
        map.delete("o-4").await.unwrap();

        let keys = map.keys().unwrap();
        assert_eq!(keys, vec!["o-5".to_string()]);
    }

    #[tokio::test]
    async fn reopen_resumes_from_persisted_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join("stream");
        let map_dir = dir.path().join("map");

        {
            let store = EventStore::open("orders", StoreConfig::new(&stream_dir).without_fsync())
                .await
                .unwrap();
            let stream = Stream::new(store, Arc::new(NoEncryption));
            let cancel = CancellationToken::new();
            let config = MapConfig::new("orders", &map_dir);
            let map = EventMap::<Order, OrderMeta>::open(config, stream, cancel.clone())
                .await
                .unwrap();

            map.set("o-1", OrderMeta::default(), Order { total_cents: 10 })
                .await
                .unwrap();
            map.set("o-2", OrderMeta::default(), Order { total_cents: 20 })
                .await
                .unwrap();
            assert_eq!(map.checkpoint(), Position(2));

            // Give the apply loop a moment to observe cancellation and drop
            // its sled handles before we reopen the same directory below.
            cancel.cancel();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        let store = EventStore::open("orders", StoreConfig::new(&stream_dir).without_fsync())
            .await
            .unwrap();
        let stream = Stream::new(store, Arc::new(NoEncryption));
        let cancel = CancellationToken::new();
        let config = MapConfig::new("orders", &map_dir);
        let map = EventMap::<Order, OrderMeta>::open(config, stream, cancel.clone())
            .await
            .unwrap();

        // Already-applied entries are visible immediately from the
        // persisted trees, with no replay through the apply loop.
        assert_eq!(map.get("o-1").unwrap(), Order { total_cents: 10 });
        assert_eq!(map.get("o-2").unwrap(), Order { total_cents: 20 });
        assert_eq!(map.checkpoint(), Position(2));

        // A fresh write is applied starting from the resumed checkpoint,
        // not by replaying o-1/o-2 from position zero.
        map.set("o-3", OrderMeta::default(), Order { total_cents: 30 })
            .await
            .unwrap();
        assert_eq!(map.checkpoint(), Position(3));
        cancel.cancel();
    }

    #[tokio::test]
    async fn two_replicas_converge_over_one_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open("orders", StoreConfig::new(dir.path().join("stream")).without_fsync())
            .await
            .unwrap();
        let stream = Stream::new(store, Arc::new(NoEncryption));

        let cancel_a = CancellationToken::new();
        let map_a = EventMap::<Order, OrderMeta>::open(
            MapConfig::new("orders", dir.path().join("map-a")),
            stream.clone(),
            cancel_a.clone(),
        )
        .await
        .unwrap();

        let cancel_b = CancellationToken::new();
        let map_b = EventMap::<Order, OrderMeta>::open(
            MapConfig::new("orders", dir.path().join("map-b")),
            stream.clone(),
            cancel_b.clone(),
        )
        .await
        .unwrap();

        map_a
            .set("o-1", OrderMeta::default(), Order { total_cents: 42 })
            .await
            .unwrap();

        // Replica B tails the same underlying stream independently; give
        // its apply loop a moment to catch up.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(map_b.get("o-1").unwrap(), Order { total_cents: 42 });

        cancel_a.cancel();
        cancel_b.cancel();
    }
}
