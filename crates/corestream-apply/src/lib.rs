#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **corestream-apply** – Set-helper apply loop (component C): tails a
//! [`corestream_stream::TypedStream`], dispatches each event to an
//! [`Applier`], and gives callers a `set_and_wait` primitive that publishes
//! an event and blocks until that same event has been applied locally
//! (read-your-writes).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use corestream_stream::{TypedEvent, TypedStream};
use corestream_types::{Error, EventKey, EventType, Position, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Callbacks invoked by the apply loop as events arrive, in stream order.
///
/// Implementations are expected to make their own writes idempotent and
/// atomic with the checkpoint they persist — the apply loop does not retry
/// a failed callback, it only logs and continues (matching the teacher's
/// Set-Helper contract: a single bad event must not wedge the loop).
#[async_trait]
pub trait Applier<T>: Send + Sync {
    /// Apply a `Created` or `Updated` event.
    async fn on_upsert(&self, event: &TypedEvent<T>) -> Result<()>;
    /// Apply a `Deleted` event.
    async fn on_delete(&self, event: &TypedEvent<T>) -> Result<()>;
}

struct Inner<T> {
    stream: TypedStream<T>,
    pending: DashMap<Position, oneshot::Sender<()>>,
    last_applied: AtomicU64,
}

/// Publishes events through a [`TypedStream`] and blocks callers until their
/// own write has round-tripped through the apply loop.
#[derive(Clone)]
pub struct SetHelper<T> {
    inner: Arc<Inner<T>>,
    cancel: CancellationToken,
}

impl<T> SetHelper<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start applying `stream` from `from`, dispatching to `applier`. The
    /// apply loop runs until `cancel` fires or every [`SetHelper`] clone is
    /// dropped, whichever happens first — the background task holds only a
    /// [`Weak`] reference so it never keeps the helper alive on its own.
    pub fn spawn(
        stream: TypedStream<T>,
        applier: Arc<dyn Applier<T>>,
        from: Position,
        cancel: CancellationToken,
    ) -> SetHelper<T> {
        let inner = Arc::new(Inner {
            stream,
            pending: DashMap::new(),
            last_applied: AtomicU64::new(from.0),
        });

        let weak = Arc::downgrade(&inner);
        let loop_cancel = cancel.clone();
        let mut events = inner.stream.stream(from, None, loop_cancel.clone());
        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    event = events.recv() => {
                        match event {
                            Some(Ok(event)) => apply_one(&inner, &applier, event).await,
                            Some(Err(e)) => warn!(error = %e, "set-helper dropping undecodable event"),
                            None => return,
                        }
                    }
                }
            }
        });

        SetHelper { inner, cancel }
    }

    /// Publish `data` and block until the apply loop has processed it.
    pub async fn set_and_wait(
        &self,
        event_type: EventType,
        data_type: impl Into<String>,
        version: impl Into<String>,
        key: EventKey,
        data: &T,
    ) -> Result<()>
    where
        T: Sync,
    {
        let written = self
            .inner
            .stream
            .store(event_type, data_type, version, key, data)
            .await?;
        self.wait_for(written.position).await
    }

    /// The underlying stream, for read-only access (e.g. `end()`).
    pub fn stream(&self) -> &TypedStream<T> {
        &self.inner.stream
    }

    async fn wait_for(&self, position: Position) -> Result<()> {
        loop {
            if self.inner.last_applied.load(Ordering::SeqCst) >= position.0 {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            self.inner.pending.insert(position, tx);
            // Close the race against the apply loop crossing `position`
            // between our atomic load above and the insert: re-check now
            // that the waiter is registered.
            if self.inner.last_applied.load(Ordering::SeqCst) >= position.0 {
                self.inner.pending.remove(&position);
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                result = rx => {
                    if result.is_err() {
                        // sender dropped without sending: loop and re-check
                        // rather than assume success.
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn apply_one<T>(inner: &Inner<T>, applier: &Arc<dyn Applier<T>>, event: TypedEvent<T>) {
    let position = event.position;
    let result = match event.event_type {
        EventType::Created | EventType::Updated => applier.on_upsert(&event).await,
        EventType::Deleted => applier.on_delete(&event).await,
    };
    if let Err(e) = result {
        warn!(position = position.0, error = %e, "apply callback failed");
    } else {
        debug!(position = position.0, "applied event");
    }
    inner.last_applied.store(position.0, Ordering::SeqCst);
    if let Some((_, tx)) = inner.pending.remove(&position) {
        let _ = tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corestream_store::{EventStore, StoreConfig};
    use corestream_stream::{NoEncryption, Stream};
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Payload {
        value: u64,
    }

    struct RecordingApplier {
        upserts: Mutex<Vec<u64>>,
        deletes: Mutex<Vec<u64>>,
    }

    impl RecordingApplier {
        fn new() -> Self {
            RecordingApplier {
                upserts: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Applier<Payload> for RecordingApplier {
        async fn on_upsert(&self, event: &TypedEvent<Payload>) -> Result<()> {
            self.upserts.lock().unwrap().push(event.data.value);
            Ok(())
        }
        async fn on_delete(&self, event: &TypedEvent<Payload>) -> Result<()> {
            self.deletes.lock().unwrap().push(event.data.value);
            Ok(())
        }
    }

    #[tokio::test]
    async fn set_and_wait_resolves_after_apply() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open("apply1", StoreConfig::new(dir.path()).without_fsync())
            .await
            .unwrap();
        let stream = Stream::new(store, Arc::new(NoEncryption)).typed::<Payload>();
        let applier = Arc::new(RecordingApplier::new());
        let cancel = CancellationToken::new();
        let helper = SetHelper::spawn(stream, applier.clone(), Position::START, cancel.clone());

        let key = corestream_types::hash_key("x");
        helper
            .set_and_wait(EventType::Created, "things", "1.0.0", key, &Payload { value: 5 })
            .await
            .unwrap();

        assert_eq!(applier.upserts.lock().unwrap().as_slice(), &[5]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn set_and_wait_dispatches_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open("apply2", StoreConfig::new(dir.path()).without_fsync())
            .await
            .unwrap();
        let stream = Stream::new(store, Arc::new(NoEncryption)).typed::<Payload>();
        let applier = Arc::new(RecordingApplier::new());
        let cancel = CancellationToken::new();
        let helper = SetHelper::spawn(stream, applier.clone(), Position::START, cancel.clone());

        let key = corestream_types::hash_key("y");
        helper
            .set_and_wait(EventType::Deleted, "things", "1.0.0", key, &Payload { value: 9 })
            .await
            .unwrap();

        assert_eq!(applier.deletes.lock().unwrap().as_slice(), &[9]);
        cancel.cancel();
    }
}
