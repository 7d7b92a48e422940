//! In-process implementation of the remote feed contract.
//!
//! `MemoryFeed` behaves like a small multi-writer remote store: every
//! accepted mutation pushes a complete authoritative snapshot to all live
//! subscribers of the touched collection, and uploads stream in fixed-size
//! chunks with progress events. It backs the engine tests and doubles as a
//! local/demo backend. Failure injection covers the error paths a real
//! transport would produce.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::models::{Document, DocumentDraft, DocumentId, DocumentPatch};

use super::{
    CollectionFeed, FeedEvent, ListQuery, OrderDirection, OrderField, RemoteFeed, TransferEvent,
    TransferHandle,
};

#[derive(Default)]
struct Store {
    collections: HashMap<String, Vec<Document>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<FeedEvent>>>,
    objects: HashMap<String, Vec<u8>>,
    fail_next_transfer: Option<String>,
    fail_next_url_resolution: Option<String>,
}

/// Pacing handle for a gated [`MemoryFeed`].
///
/// A gated feed holds every transfer until chunks are explicitly released,
/// which makes mid-flight assertions (progress steps, cancellation)
/// deterministic in tests.
#[derive(Clone)]
pub struct TransferGate {
    permits: Arc<Semaphore>,
}

impl TransferGate {
    /// Let every paced transfer move `chunks` more chunks.
    pub fn release_chunks(&self, chunks: usize) {
        self.permits.add_permits(chunks);
    }
}

/// In-memory multi-writer store implementing [`RemoteFeed`].
#[derive(Clone)]
pub struct MemoryFeed {
    store: Arc<Mutex<Store>>,
    config: FeedConfig,
    gate: Option<Arc<Semaphore>>,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(FeedConfig::default())
    }

    #[must_use]
    pub fn with_config(config: FeedConfig) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            config,
            gate: None,
        }
    }

    /// Build a feed whose transfers wait on an explicit chunk gate.
    #[must_use]
    pub fn gated(config: FeedConfig) -> (Self, TransferGate) {
        let permits = Arc::new(Semaphore::new(0));
        let feed = Self {
            store: Arc::new(Mutex::new(Store::default())),
            config,
            gate: Some(Arc::clone(&permits)),
        };
        (feed, TransferGate { permits })
    }

    /// Make the next `start_upload` fail mid-transfer with `reason`.
    pub fn fail_next_transfer(&self, reason: impl Into<String>) {
        self.lock().fail_next_transfer = Some(reason.into());
    }

    /// Make the next `resolve_download_url` fail with `reason`.
    pub fn fail_next_url_resolution(&self, reason: impl Into<String>) {
        self.lock().fail_next_url_resolution = Some(reason.into());
    }

    /// Drop every live feed on `collection`, delivering `reason` first.
    pub fn drop_collection_feed(&self, collection: &str, reason: impl Into<String>) {
        let reason = reason.into();
        let mut store = self.lock();
        if let Some(senders) = store.subscribers.remove(collection) {
            for sender in senders {
                let _ = sender.try_send(FeedEvent::Lost(reason.clone()));
            }
        }
    }

    /// Whether an object is currently stored at `path`.
    #[must_use]
    pub fn has_object(&self, path: &str) -> bool {
        self.lock().objects.contains_key(path)
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(store: &mut Store, collection: &str) {
        let snapshot = store
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default();
        let Some(senders) = store.subscribers.get_mut(collection) else {
            return;
        };
        senders.retain(|sender| {
            match sender.try_send(FeedEvent::Snapshot(snapshot.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // a subscriber that cannot keep up would otherwise go
                    // silently stale; ending its feed makes the loss explicit
                    warn!(collection, "subscriber lagging, feed dropped");
                    false
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl RemoteFeed for MemoryFeed {
    async fn subscribe_collection(&self, collection: &str) -> Result<CollectionFeed> {
        let collection = normalize_collection(collection)?;
        let (tx, rx) = mpsc::channel(self.config.event_buffer);

        let mut store = self.lock();
        let snapshot = store
            .collections
            .get(&collection)
            .cloned()
            .unwrap_or_default();
        tx.try_send(FeedEvent::Snapshot(snapshot))
            .map_err(|_| Error::Subscription("feed buffer rejected initial snapshot".to_string()))?;
        store.subscribers.entry(collection).or_default().push(tx);

        Ok(CollectionFeed::new(rx))
    }

    async fn create_doc(&self, collection: &str, draft: DocumentDraft) -> Result<DocumentId> {
        let collection = normalize_collection(collection)?;
        let id: DocumentId = Uuid::now_v7().to_string().parse()?;

        let mut store = self.lock();
        store
            .collections
            .entry(collection.clone())
            .or_default()
            .push(draft.into_document(id.clone()));
        Self::broadcast(&mut store, &collection);
        debug!(%collection, id = %id, "document created");
        Ok(id)
    }

    async fn update_doc(
        &self,
        collection: &str,
        id: &DocumentId,
        patch: DocumentPatch,
    ) -> Result<()> {
        let collection = normalize_collection(collection)?;

        let mut store = self.lock();
        let document = store
            .collections
            .get_mut(&collection)
            .and_then(|docs| docs.iter_mut().find(|doc| doc.id == *id))
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        for (field, value) in patch.fields {
            document.fields.insert(field, value);
        }
        // updated_at never moves backwards, even for skewed caller clocks
        document.updated_at = patch.updated_at.max(document.updated_at);
        Self::broadcast(&mut store, &collection);
        Ok(())
    }

    async fn delete_doc(&self, collection: &str, id: &DocumentId) -> Result<()> {
        let collection = normalize_collection(collection)?;

        let mut store = self.lock();
        let docs = store
            .collections
            .get_mut(&collection)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let before = docs.len();
        docs.retain(|doc| doc.id != *id);
        if docs.len() == before {
            return Err(Error::NotFound(id.to_string()));
        }
        Self::broadcast(&mut store, &collection);
        Ok(())
    }

    async fn list_docs(&self, collection: &str, query: ListQuery) -> Result<Vec<Document>> {
        let collection = normalize_collection(collection)?;

        let mut docs = self
            .lock()
            .collections
            .get(&collection)
            .cloned()
            .unwrap_or_default();

        if let Some((field, value)) = &query.field_equals {
            docs.retain(|doc| doc.fields.get(field) == Some(value));
        }
        if let Some((field, direction)) = query.order {
            docs.sort_by_key(|doc| match field {
                OrderField::CreatedAt => doc.created_at,
                OrderField::UpdatedAt => doc.updated_at,
            });
            if direction == OrderDirection::Descending {
                docs.reverse();
            }
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn start_upload(&self, path: &str, bytes: Vec<u8>) -> Result<TransferHandle> {
        let path = normalize_object_path(path)?;
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let injected_failure = self.lock().fail_next_transfer.take();
        let transfer = Transfer {
            store: Arc::clone(&self.store),
            gate: self.gate.clone(),
            chunk_bytes: self.config.upload_chunk_bytes as u64,
            path,
            bytes,
            injected_failure,
        };
        tokio::spawn(transfer.run(cancel_rx, events_tx));

        Ok(TransferHandle::new(events_rx, cancel_tx))
    }

    async fn resolve_download_url(&self, path: &str) -> Result<String> {
        let path = normalize_object_path(path)?;

        let mut store = self.lock();
        if let Some(reason) = store.fail_next_url_resolution.take() {
            return Err(Error::UrlResolution(reason));
        }
        if store.objects.contains_key(&path) {
            Ok(format!("memory://objects/{path}"))
        } else {
            Err(Error::UrlResolution(format!(
                "no object stored at '{path}'"
            )))
        }
    }

    async fn delete_object(&self, path: &str) -> Result<()> {
        let path = normalize_object_path(path)?;
        self.lock()
            .objects
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(path))
    }
}

struct Transfer {
    store: Arc<Mutex<Store>>,
    gate: Option<Arc<Semaphore>>,
    chunk_bytes: u64,
    path: String,
    bytes: Vec<u8>,
    injected_failure: Option<String>,
}

impl Transfer {
    async fn run(self, mut cancel_rx: watch::Receiver<bool>, events: mpsc::Sender<TransferEvent>) {
        let total = self.bytes.len() as u64;

        if let Some(reason) = self.injected_failure {
            let first = self.chunk_bytes.min(total);
            let _ = events
                .send(TransferEvent::Progress {
                    transferred: first,
                    total,
                })
                .await;
            let _ = events.send(TransferEvent::Failed(reason)).await;
            return;
        }

        let mut transferred = 0u64;
        loop {
            if let Some(gate) = &self.gate {
                // stay responsive to cancellation while parked on the gate
                tokio::select! {
                    permit = gate.acquire() => {
                        let Ok(permit) = permit else { return };
                        permit.forget();
                    }
                    _ = cancel_rx.changed() => return,
                }
            }
            if *cancel_rx.borrow() {
                debug!(path = %self.path, transferred, "transfer cancelled");
                return;
            }
            transferred = (transferred + self.chunk_bytes).min(total);
            if events
                .send(TransferEvent::Progress { transferred, total })
                .await
                .is_err()
            {
                return;
            }
            if transferred >= total {
                break;
            }
        }

        {
            let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            store.objects.insert(self.path.clone(), self.bytes);
        }
        let _ = events.send(TransferEvent::Completed).await;
    }
}

fn normalize_collection(collection: &str) -> Result<String> {
    let collection = collection.trim();
    if collection.is_empty() {
        return Err(Error::InvalidInput(
            "Collection name cannot be empty".to_string(),
        ));
    }
    Ok(collection.to_string())
}

fn normalize_object_path(path: &str) -> Result<String> {
    let path = path.trim().trim_matches('/');
    if path.is_empty() {
        return Err(Error::InvalidInput(
            "Object path cannot be empty".to_string(),
        ));
    }
    Ok(path.to_string())
}
