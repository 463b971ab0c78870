#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **corestream** – event-sourced, replicated state over an append-only
//! event stream.
//!
//! This crate is a thin, feature-gated facade over the `corestream-*`
//! family: a durable single-writer log ([`corestream_store`]), a typed and
//! optionally-encrypted view over it ([`corestream_stream`]), a set-and-wait
//! apply loop ([`corestream_apply`]), a materialized map built on top of it
//! ([`corestream_map`]), a competing-consumer lease layer
//! ([`corestream_consensus`]), and a scheduled-task engine built on that
//! ([`corestream_scheduler`]).
//!
//! Depend on `corestream` and enable only the pieces you need, or depend on
//! the individual crates directly if you want tighter control over your
//! dependency graph.

pub use corestream_types as types;

#[cfg(feature = "store")]
pub use corestream_store as store;

#[cfg(feature = "stream")]
pub use corestream_stream as stream;

#[cfg(feature = "apply")]
pub use corestream_apply as apply;

#[cfg(feature = "map")]
pub use corestream_map as map;

#[cfg(feature = "consensus")]
pub use corestream_consensus as consensus;

#[cfg(feature = "scheduler")]
pub use corestream_scheduler as scheduler;

/// Commonly used types, re-exported for a single `use corestream::prelude::*`.
pub mod prelude {
    pub use corestream_types::{Error, Event, EventKey, EventType, NewEvent, Position, Result, Written};

    #[cfg(feature = "store")]
    pub use corestream_store::{EventStore, StoreConfig};

    #[cfg(feature = "stream")]
    pub use corestream_stream::{KeyProvider, NoEncryption, Stream, TypedEvent, TypedStream};

    #[cfg(feature = "apply")]
    pub use corestream_apply::{Applier, SetHelper};

    #[cfg(feature = "map")]
    pub use corestream_map::{EventMap, MapConfig};

    #[cfg(feature = "consensus")]
    pub use corestream_consensus::{CompetingConsumer, CompetingEvent, ConsensusBackend, Lease, SingleNodeConsensus};

    #[cfg(feature = "scheduler")]
    pub use corestream_scheduler::{ScheduledTasks, SchedulerConfig, TaskExecutor, TaskMetadata, TaskSnapshot};
}

#[cfg(all(test, feature = "scheduler"))]
mod tests {
    use super::prelude::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Reminder {
        text: String,
    }

    struct CountingExecutor(Arc<AtomicUsize>);

    #[async_trait]
    impl TaskExecutor<Reminder> for CountingExecutor {
        async fn execute(&self, _task: &Reminder, _cancel: &CancellationToken) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn end_to_end_store_stream_and_schedule() {
        let dir = tempfile::tempdir().unwrap();

        let store = EventStore::open("reminders", StoreConfig::new(dir.path()).without_fsync())
            .await
            .unwrap();
        let raw_stream = Stream::new(store, Arc::new(NoEncryption));

        let runs = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(SingleNodeConsensus::new());
        let cancel = CancellationToken::new();
        let config = SchedulerConfig::new("reminders").base_timeout(Duration::from_secs(5));
        let scheduler = ScheduledTasks::spawn(
            config,
            raw_stream,
            backend,
            Arc::new(CountingExecutor(runs.clone())),
            cancel.clone(),
        );

        scheduler
            .create("r1", chrono::Utc::now(), None, Reminder { text: "stand up".into() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }
}
