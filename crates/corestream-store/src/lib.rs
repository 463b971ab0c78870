#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **corestream-store** – Single-writer, multi-reader append-only event
//! store (component A).
//!
//! One file per stream under `<base_dir>/streams/<name>`, opened for append
//! and fsynced after every write. A single dedicated task owns the file
//! handle; all appends are serialized through it. Readers open independent
//! read handles and tail the file from a given [`Position`], blocking on a
//! condition variable that the writer signals after each durable append.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::Utc;
use corestream_types::{Error, Event, NewEvent, Position, Result, Written};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Poll interval used while tailing once a decode hits end-of-file.
///
/// Doubles as both halves of the spec's dual wait policy: the writer signals
/// the condition variable on every durable append, so a tailer that is truly
/// caught up wakes immediately; one that raced the signal simply falls
/// through the timeout and retries. A single `wait_timeout` implements both.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration for an [`EventStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory under which `streams/` is created.
    pub base_dir: PathBuf,
    /// Whether to fsync after every write. Disabling this is only intended
    /// for tests that don't care about crash durability.
    pub fsync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            base_dir: PathBuf::from("."),
            fsync: true,
        }
    }
}

impl StoreConfig {
    /// Build a config rooted at `base_dir` with fsync enabled.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        StoreConfig {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Disable fsync (test-only convenience).
    pub fn without_fsync(mut self) -> Self {
        self.fsync = false;
        self
    }
}

/// On-disk record: a caller's event plus the position and timestamp the
/// writer assigned it. Self-delimiting JSON; framing is decode-driven, no
/// length prefix or newline separators required.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    event: NewEvent,
    position: Position,
    created: chrono::DateTime<Utc>,
}

/// A queued append, together with where to report its outcome.
pub struct WriteRequest {
    /// The event to append.
    pub event: NewEvent,
    /// Receives the outcome once durable, then is dropped (closed).
    pub status: Option<oneshot::Sender<Result<Written>>>,
}

struct Shared {
    /// Position assigned to the next append (pre-increment monotonic counter).
    counter: AtomicU64,
    /// Position of the last *successfully* persisted append.
    last_written: AtomicU64,
    /// Signaled by the writer after every successful append.
    cond: Arc<(Mutex<()>, Condvar)>,
    path: PathBuf,
}

/// An append-only event stream store.
///
/// Cloning an `EventStore` is cheap and shares the same writer task and file.
#[derive(Clone)]
pub struct EventStore {
    name: String,
    write_tx: mpsc::Sender<WriteRequest>,
    shared: Arc<Shared>,
}

impl EventStore {
    /// Open (or create) the stream named `name` under `config.base_dir`.
    ///
    /// Reusing an existing stream name is safe: existing content is scanned
    /// once to recover the last assigned position, then appends resume from
    /// there (SPEC_FULL §9.8).
    pub async fn open(name: impl Into<String>, config: StoreConfig) -> Result<EventStore> {
        let name = name.into();
        let streams_dir = config.base_dir.join("streams");
        std::fs::create_dir_all(&streams_dir)?;
        let path = streams_dir.join(&name);

        let last_position = recover_last_position(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let shared = Arc::new(Shared {
            counter: AtomicU64::new(last_position.0),
            last_written: AtomicU64::new(last_position.0),
            cond: Arc::new((Mutex::new(()), Condvar::new())),
            path: path.clone(),
        });

        let (write_tx, write_rx) = mpsc::channel(64);
        let writer_shared = shared.clone();
        let fsync = config.fsync;
        tokio::task::spawn_blocking(move || writer_loop(file, write_rx, writer_shared, fsync));

        debug!(stream = %name, last_position = last_position.0, "opened event store");
        Ok(EventStore {
            name,
            write_tx,
            shared,
        })
    }

    /// The stream's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an append and await its durable outcome.
    pub async fn append(&self, event: NewEvent) -> Result<Written> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest {
                event,
                status: Some(tx),
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// The raw write handle, for callers that want to queue a write and poll
    /// its status channel themselves instead of awaiting `append`.
    pub fn write_handle(&self) -> mpsc::Sender<WriteRequest> {
        self.write_tx.clone()
    }

    /// Best-effort snapshot of the last durably written position.
    pub fn end(&self) -> Position {
        Position(self.shared.last_written.load(Ordering::SeqCst))
    }

    /// Tail the stream from `from`, exclusive, delivering events in position
    /// order on the returned channel until `cancel` fires.
    pub fn stream(&self, from: Position, cancel: tokio_util::sync::CancellationToken) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(16);
        let path = self.shared.path.clone();
        let shared = self.shared.clone();
        let effective_from = if from == Position::END {
            Position(shared.last_written.load(Ordering::SeqCst))
        } else {
            from
        };
        tokio::task::spawn_blocking(move || tail_loop(path, effective_from, shared, cancel, tx));
        rx
    }
}

/// Scan an existing stream file (if any) to recover the last assigned
/// position, so a fresh writer continues the dense sequence instead of
/// restarting it.
fn recover_last_position(path: &Path) -> Result<Position> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Position::START),
        Err(e) => return Err(Error::Io(e)),
    };
    let reader = BufReader::new(file);
    let mut last = Position::START;
    let mut stream = serde_json::Deserializer::from_reader(reader).into_iter::<Record>();
    loop {
        match stream.next() {
            Some(Ok(record)) => last = record.position,
            Some(Err(e)) if e.is_eof() => break,
            Some(Err(e)) => {
                warn!(error = %e, "truncated trailing record while recovering position; treating as end of log");
                break;
            }
            None => break,
        }
    }
    Ok(last)
}

fn writer_loop(mut file: File, mut rx: mpsc::Receiver<WriteRequest>, shared: Arc<Shared>, fsync: bool) {
    while let Some(req) = rx.blocking_recv() {
        let position = Position(shared.counter.fetch_add(1, Ordering::SeqCst) + 1);
        let created = Utc::now();
        let result = (|| -> Result<Written> {
            let record = Record {
                event: req.event,
                position,
                created,
            };
            let bytes = serde_json::to_vec(&record).map_err(|e| Error::Encode(e.to_string()))?;
            file.write_all(&bytes)?;
            if fsync {
                file.sync_data()?;
            }
            Ok(Written {
                time: created,
                position,
            })
        })();

        match &result {
            Ok(written) => {
                shared.last_written.store(written.position.0, Ordering::SeqCst);
                let (lock, cvar) = &*shared.cond;
                let _guard = lock.lock().unwrap();
                cvar.notify_all();
            }
            Err(e) => {
                error!(error = %e, position = position.0, "failed to write event to store");
            }
        }

        if let Some(status) = req.status {
            let _ = status.send(result);
        }
    }
}

fn tail_loop(
    path: PathBuf,
    from: Position,
    shared: Arc<Shared>,
    cancel: tokio_util::sync::CancellationToken,
    tx: mpsc::Sender<Event>,
) {
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "failed to open stream for tailing");
            return;
        }
    };
    let reader = BufReader::new(file);
    let mut stream = serde_json::Deserializer::from_reader(reader).into_iter::<Record>();

    loop {
        if cancel.is_cancelled() {
            return;
        }
        match stream.next() {
            Some(Ok(record)) => {
                if record.position <= from {
                    continue;
                }
                let event = Event {
                    position: record.position,
                    created: record.created,
                    event_type: record.event.event_type,
                    data_type: record.event.data_type,
                    version: record.event.version,
                    key: record.event.key,
                    payload: record.event.payload,
                };
                if tx.blocking_send(event).is_err() {
                    return; // receiver dropped
                }
            }
            Some(Err(e)) if e.is_eof() => {
                let (lock, cvar) = &*shared.cond;
                let guard = lock.lock().unwrap();
                let _ = cvar.wait_timeout(guard, TAIL_POLL_INTERVAL);
                if cancel.is_cancelled() {
                    return;
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "corrupt event store; terminating reader");
                return;
            }
            None => return,
        }
    }
}
