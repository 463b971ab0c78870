#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **corestream-stream** – Typed, optionally-encrypted view over a
//! [`corestream_store::EventStore`] (component B).
//!
//! Callers work with their own payload types instead of raw bytes; a
//! [`KeyProvider`] decides, per event key, whether the payload is encrypted
//! at rest and with which AES-256-GCM key.

mod crypto;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use corestream_store::EventStore;
pub use corestream_types::{Error, EventKey, EventType, Position, Result, Written};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use crypto::AesGcmKey;

/// Resolves the AES-256-GCM key (if any) that scopes a given event key.
///
/// Returning `Ok(None)` means the payload is stored in the clear; this is
/// the common case for non-sensitive data types.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Look up the encryption key for `key`, if the scope is encrypted.
    async fn key_for(&self, key: &EventKey) -> Result<Option<AesGcmKey>>;
}

/// A [`KeyProvider`] that never encrypts. The default for non-sensitive
/// data types.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

#[async_trait]
impl KeyProvider for NoEncryption {
    async fn key_for(&self, _key: &EventKey) -> Result<Option<AesGcmKey>> {
        Ok(None)
    }
}

/// A [`KeyProvider`] backed by a single fixed key, used for every scope.
#[derive(Clone)]
pub struct StaticKeyProvider(AesGcmKey);

impl StaticKeyProvider {
    /// Wrap a fixed key that will encrypt every event stored through it.
    pub fn new(key: AesGcmKey) -> Self {
        StaticKeyProvider(key)
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn key_for(&self, _key: &EventKey) -> Result<Option<AesGcmKey>> {
        Ok(Some(self.0))
    }
}

/// An event decoded back into its caller-defined payload type.
#[derive(Debug, Clone)]
pub struct TypedEvent<T> {
    /// Dense monotonic position assigned at append time.
    pub position: Position,
    /// Created, Updated, or Deleted.
    pub event_type: EventType,
    /// Application-defined payload kind.
    pub data_type: String,
    /// Schema version of `payload`.
    pub version: String,
    /// Hash of the logical id.
    pub key: EventKey,
    /// The decoded payload.
    pub data: T,
}

/// Typed, optionally-encrypted wrapper around an [`EventStore`].
#[derive(Clone)]
pub struct Stream {
    store: EventStore,
    key_provider: Arc<dyn KeyProvider>,
}

impl Stream {
    /// Wrap `store`, encrypting/decrypting payloads via `key_provider`.
    pub fn new(store: EventStore, key_provider: Arc<dyn KeyProvider>) -> Stream {
        Stream { store, key_provider }
    }

    /// The underlying stream's name.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Serialize, optionally encrypt, and append `data`.
    pub async fn store<T: Serialize>(
        &self,
        event_type: EventType,
        data_type: impl Into<String>,
        version: impl Into<String>,
        key: EventKey,
        data: &T,
    ) -> Result<Written> {
        let plaintext = serde_json::to_vec(data).map_err(|e| Error::Encode(e.to_string()))?;
        let payload = match self.key_provider.key_for(&key).await? {
            Some(aead_key) => crypto::encrypt(&aead_key, &plaintext)?,
            None => plaintext,
        };
        self.store
            .append(corestream_types::NewEvent {
                event_type,
                data_type: data_type.into(),
                version: version.into(),
                key,
                payload,
            })
            .await
    }

    /// Best-effort snapshot of the last durably written position.
    pub fn end(&self) -> Position {
        self.store.end()
    }

    /// Tail the stream from `from`, decrypting and decoding each event into
    /// `T` as it arrives. `data_type` restricts delivery to events whose
    /// `data_type` field matches exactly; `None` delivers every event on the
    /// stream. Decode/decrypt failures are reported inline rather than
    /// silently dropped, so a caller can decide whether a single bad record
    /// should abort the whole subscription.
    pub fn stream<T>(
        &self,
        from: Position,
        data_type: Option<&str>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<TypedEvent<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut raw = self.store.stream(from, cancel.clone());
        let key_provider = self.key_provider.clone();
        let data_type = data_type.map(|s| s.to_string());
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(dt) = &data_type {
                    if &event.data_type != dt {
                        continue;
                    }
                }
                let decoded = decode::<T>(&event, key_provider.as_ref()).await;
                if decoded.is_err() {
                    warn!(position = event.position.0, "failed to decode event; forwarding error");
                }
                if tx.send(decoded).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    /// A stream handle bound to a single expected payload type, for callers
    /// that only ever read one shape off this stream.
    pub fn typed<T>(&self) -> TypedStream<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        TypedStream {
            inner: self.clone(),
            _marker: PhantomData,
        }
    }
}

async fn decode<T: DeserializeOwned>(
    event: &corestream_types::Event,
    key_provider: &dyn KeyProvider,
) -> Result<TypedEvent<T>> {
    let plaintext = match key_provider.key_for(&event.key).await? {
        Some(aead_key) => crypto::decrypt(&aead_key, &event.payload)?,
        None => event.payload.clone(),
    };
    let data = serde_json::from_slice(&plaintext).map_err(|e| Error::Decode(e.to_string()))?;
    Ok(TypedEvent {
        position: event.position,
        event_type: event.event_type,
        data_type: event.data_type.clone(),
        version: event.version.clone(),
        key: event.key,
        data,
    })
}

/// Convenience wrapper over [`Stream`] for callers dealing with a single
/// payload type throughout.
#[derive(Clone)]
pub struct TypedStream<T> {
    inner: Stream,
    _marker: PhantomData<T>,
}

impl<T> TypedStream<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// See [`Stream::store`].
    pub async fn store(
        &self,
        event_type: EventType,
        data_type: impl Into<String>,
        version: impl Into<String>,
        key: EventKey,
        data: &T,
    ) -> Result<Written> {
        self.inner.store(event_type, data_type, version, key, data).await
    }

    /// See [`Stream::stream`].
    pub fn stream(
        &self,
        from: Position,
        data_type: Option<&str>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<TypedEvent<T>>> {
        self.inner.stream(from, data_type, cancel)
    }

    /// See [`Stream::end`].
    pub fn end(&self) -> Position {
        self.inner.end()
    }
}
