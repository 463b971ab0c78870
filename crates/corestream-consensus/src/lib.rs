#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **corestream-consensus** – Competing-consumer delivery (component E):
//! every replica tails the same stream, but a pluggable [`ConsensusBackend`]
//! ensures exactly one of them "wins" each event and is allowed to act on
//! it, via a time-bounded [`Lease`].
//!
//! The backend is an external collaborator in general — a real deployment
//! would back it with something distributed (etcd, a DB row lock, Raft).
//! [`SingleNodeConsensus`] is the in-process reference implementation used
//! by tests and single-node deployments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corestream_stream::{Position, TypedEvent, TypedStream};
use corestream_types::Result;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Extra margin added to a caller-supplied base timeout before a lease is
/// considered safe to hand out; mirrors the teacher scheduler's fixed
/// five-second cushion against clock skew and scheduling jitter.
pub const LEASE_TIMEOUT_OFFSET: Duration = Duration::from_secs(5);

/// A time-bounded, exclusive claim on an event id.
///
/// The holder should race its work against [`Lease::lost`] firing — if it
/// fires before the work calls `release`, another replica is free to retry
/// the same event and the holder must not act on it further.
pub struct Lease {
    id: String,
    expires_at: DateTime<Utc>,
    lost: CancellationToken,
}

impl Lease {
    /// The id this lease guards.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the backend considers this lease expired absent a renewal.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Resolves once the lease has been lost (expired or preempted).
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    /// Whether the lease has already been lost.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }
}

/// A pluggable exactly-one-owner lease backend.
#[async_trait]
pub trait ConsensusBackend: Send + Sync {
    /// Attempt to claim `id` for `duration`. Returns `None` if another
    /// holder already has it.
    async fn try_acquire(&self, id: &str, duration: Duration) -> Result<Option<Lease>>;

    /// Voluntarily give up a held lease before it expires, letting another
    /// replica claim `id` immediately.
    async fn release(&self, lease: Lease) -> Result<()>;
}

/// Compute how long a lease should run for, given a fixed `base_timeout`
/// and an optional future point `after` the work isn't due until.
///
/// Work due soon gets `base_timeout + `[`LEASE_TIMEOUT_OFFSET`]. Work due
/// further out gets a lease sized to just cover the wait (`after - now - 1s`)
/// instead of holding a long lease for nothing — the lease is re-acquired
/// closer to `after` if it lapses.
pub fn lease_duration(now: DateTime<Utc>, after: DateTime<Utc>, base_timeout: Duration) -> Duration {
    let full = base_timeout + LEASE_TIMEOUT_OFFSET;
    match (after - now).to_std() {
        Ok(until_after) if until_after > full => until_after - Duration::from_secs(1),
        _ => full,
    }
}

struct LeaseState {
    token: CancellationToken,
    expires_at: DateTime<Utc>,
}

/// An in-process reference [`ConsensusBackend`]; every replica sharing one
/// instance behaves like a single competing-consumer group. Not useful
/// across processes — for that, back [`ConsensusBackend`] with something
/// distributed.
#[derive(Default)]
pub struct SingleNodeConsensus {
    leases: DashMap<String, LeaseState>,
}

impl SingleNodeConsensus {
    /// A fresh backend with no outstanding leases.
    pub fn new() -> SingleNodeConsensus {
        SingleNodeConsensus::default()
    }
}

#[async_trait]
impl ConsensusBackend for SingleNodeConsensus {
    async fn try_acquire(&self, id: &str, duration: Duration) -> Result<Option<Lease>> {
        let now = Utc::now();
        if let Some(existing) = self.leases.get(id) {
            if existing.expires_at > now && !existing.token.is_cancelled() {
                return Ok(None);
            }
        }

        let token = CancellationToken::new();
        let expires_at = now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        self.leases.insert(
            id.to_string(),
            LeaseState {
                token: token.clone(),
                expires_at,
            },
        );

        let expiry_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            expiry_token.cancel();
        });

        debug!(id, ?duration, "lease acquired");
        Ok(Some(Lease {
            id: id.to_string(),
            expires_at,
            lost: token,
        }))
    }

    async fn release(&self, lease: Lease) -> Result<()> {
        lease.lost.cancel();
        self.leases.remove(&lease.id);
        Ok(())
    }
}

/// An event delivered to the replica that won its lease.
pub struct CompetingEvent<T> {
    /// The decoded event.
    pub event: TypedEvent<T>,
    /// The lease guarding it; hold until the work is durably acknowledged,
    /// then call [`ConsensusBackend::release`].
    pub lease: Lease,
}

/// Resolves the lease duration to request for a given event. Most callers
/// use a fixed duration; the scheduler sizes it per-task via
/// [`lease_duration`].
pub type TimeoutPolicy<T> = Arc<dyn Fn(&TypedEvent<T>) -> Duration + Send + Sync>;

/// Fans a stream out to every replica, but hands each event's [`Lease`] to
/// only one of them at a time.
pub struct CompetingConsumer<T> {
    stream: TypedStream<T>,
    backend: Arc<dyn ConsensusBackend>,
    timeout: TimeoutPolicy<T>,
}

impl<T> CompetingConsumer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a competing consumer over `stream`, claiming leases through
    /// `backend` for a fixed `timeout` per event.
    pub fn new(stream: TypedStream<T>, backend: Arc<dyn ConsensusBackend>, timeout: Duration) -> CompetingConsumer<T> {
        CompetingConsumer::with_timeout_policy(stream, backend, Arc::new(move |_| timeout))
    }

    /// Build a competing consumer whose lease duration is computed per
    /// event by `timeout`.
    pub fn with_timeout_policy(stream: TypedStream<T>, backend: Arc<dyn ConsensusBackend>, timeout: TimeoutPolicy<T>) -> CompetingConsumer<T> {
        CompetingConsumer { stream, backend, timeout }
    }

    /// Tail the stream from `from`; events this replica wins the lease for
    /// arrive on the returned channel, others are silently skipped.
    pub fn consume(&self, from: Position, cancel: CancellationToken) -> mpsc::Receiver<CompetingEvent<T>> {
        let mut raw = self.stream.stream(from, None, cancel.clone());
        let backend = self.backend.clone();
        let timeout = self.timeout.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(decoded) = raw.recv().await {
                if cancel.is_cancelled() {
                    return;
                }
                let event = match decoded {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "competing consumer dropping undecodable event");
                        continue;
                    }
                };
                let lease_id = format!("{}:{}", event.data_type, event.position);
                let duration = timeout(&event);
                match backend.try_acquire(&lease_id, duration).await {
                    Ok(Some(lease)) => {
                        if tx.send(CompetingEvent { event, lease }).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => debug!(%lease_id, "lease already held, skipping"),
                    Err(e) => tracing::warn!(error = %e, "failed to acquire lease"),
                }
            }
        });

        rx
    }
}
