//! Remote feed contract.
//!
//! The engines in this crate never speak a wire protocol themselves. They
//! consume the [`RemoteFeed`] trait: a subscribe-to-collection primitive that
//! yields ordered authoritative snapshots, request/response primitives for
//! document mutations, and a chunked resumable upload primitive. Transport,
//! persistence format, and authentication all live behind this seam.

mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::models::{Document, DocumentDraft, DocumentId, DocumentPatch};

pub use memory::{MemoryFeed, TransferGate};

/// One event delivered on a live collection feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A complete, authoritative listing of the collection at one point in
    /// time. Always replaces prior state; never merged.
    Snapshot(Vec<Document>),
    /// The feed dropped and will deliver no further snapshots.
    Lost(String),
}

/// Handle on one live collection subscription.
///
/// Events arrive strictly in the order the backend produced them. Dropping
/// the handle unsubscribes.
pub struct CollectionFeed {
    events: mpsc::Receiver<FeedEvent>,
}

impl CollectionFeed {
    #[must_use]
    pub const fn new(events: mpsc::Receiver<FeedEvent>) -> Self {
        Self { events }
    }

    /// Wait for the next feed event. `None` means the backend closed the
    /// feed without an explicit [`FeedEvent::Lost`].
    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }
}

/// One event on an in-flight resumable transfer.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Byte counts as reported by the transport, not an estimate.
    Progress { transferred: u64, total: u64 },
    /// All bytes landed. The object is durable but not yet addressable;
    /// URL resolution is a separate step.
    Completed,
    /// The transport gave up. Terminal.
    Failed(String),
}

/// Handle on one in-flight resumable transfer.
///
/// Yields zero or more `Progress` events followed by exactly one of
/// `Completed` or `Failed`, unless cancelled first. Cancellation is
/// cooperative: bytes already sent stay sent.
pub struct TransferHandle {
    events: mpsc::Receiver<TransferEvent>,
    cancel: watch::Sender<bool>,
}

impl TransferHandle {
    #[must_use]
    pub const fn new(events: mpsc::Receiver<TransferEvent>, cancel: watch::Sender<bool>) -> Self {
        Self { events, cancel }
    }

    /// Wait for the next transfer event. `None` means the transport stopped
    /// without a terminal event (treated as a failure by callers).
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Ask the transport to stop sending further bytes.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Which document attribute a one-shot listing is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderField {
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

/// Options for a one-shot collection listing, independent of any live feed.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Keep only documents whose named field equals the given value.
    pub field_equals: Option<(String, Value)>,
    /// Order of the returned listing; backend order when absent.
    pub order: Option<(OrderField, OrderDirection)>,
    /// Truncate the listing after this many documents.
    pub limit: Option<usize>,
}

impl ListQuery {
    #[must_use]
    pub fn where_field_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.field_equals = Some((field.into(), value));
        self
    }

    #[must_use]
    pub const fn order_by(mut self, field: OrderField, direction: OrderDirection) -> Self {
        self.order = Some((field, direction));
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Abstract remote feed client: live subscriptions, document mutations, and
/// resumable object transfers against one multi-writer remote store.
#[async_trait]
pub trait RemoteFeed: Send + Sync {
    /// Establish a live feed over one named collection. The backend delivers
    /// the current snapshot first, then one snapshot per accepted change.
    async fn subscribe_collection(&self, collection: &str) -> Result<CollectionFeed>;

    /// Create a document; the store assigns and returns its id.
    async fn create_doc(&self, collection: &str, draft: DocumentDraft) -> Result<DocumentId>;

    /// Partially replace a document's fields. `NotFound` when the id is absent.
    async fn update_doc(
        &self,
        collection: &str,
        id: &DocumentId,
        patch: DocumentPatch,
    ) -> Result<()>;

    /// Delete a document. `NotFound` when the id is absent.
    async fn delete_doc(&self, collection: &str, id: &DocumentId) -> Result<()>;

    /// One-shot listing with optional filter, order, and limit.
    async fn list_docs(&self, collection: &str, query: ListQuery) -> Result<Vec<Document>>;

    /// Begin a resumable upload of `bytes` to `path`.
    async fn start_upload(&self, path: &str, bytes: Vec<u8>) -> Result<TransferHandle>;

    /// Resolve a durable retrieval URL for a previously uploaded object.
    async fn resolve_download_url(&self, path: &str) -> Result<String>;

    /// Delete an uploaded object. `NotFound` when the path is absent.
    async fn delete_object(&self, path: &str) -> Result<()>;
}
