//! Collection sync engine.
//!
//! Keeps one local [`Mirror`] per named collection continuously reconciled
//! with the live feed, and exposes the mutation entry points. The
//! reconciliation rule is deliberately blunt: the latest received snapshot is
//! authoritative and fully replaces the mirror, so a mutation becomes visible
//! only once the feed echoes it back. Callers that read immediately after
//! writing may observe stale data; that is the documented consistency
//! contract, not a bug.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::feed::{CollectionFeed, FeedEvent, ListQuery, RemoteFeed};
use crate::models::{sort_newest_first, Document, DocumentDraft, DocumentId, DocumentPatch, Fields};

/// Lifecycle of one mirrored collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStatus {
    /// Subscribed, no snapshot applied yet.
    Initializing,
    /// At least one snapshot applied; mirror reflects the latest one.
    Synced,
    /// The feed dropped. Documents are stale but still served.
    Errored,
}

/// Local ordered reflection of one remote collection.
///
/// Iteration order is `created_at` descending, re-derived on every snapshot;
/// it is never an artifact of local insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Mirror {
    pub documents: Vec<Document>,
    pub status: MirrorStatus,
    /// Reason for the last feed failure, when status is `Errored`.
    pub error: Option<String>,
}

impl Mirror {
    fn initializing() -> Self {
        Self {
            documents: Vec::new(),
            status: MirrorStatus::Initializing,
            error: None,
        }
    }

    /// Look up a document by id.
    #[must_use]
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.iter().find(|doc| doc.id == *id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

struct CollectionEntry {
    mirror_rx: watch::Receiver<Mirror>,
    subscribers: usize,
    pump: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<String, CollectionEntry>>>;

/// Sync engine over one remote feed client.
///
/// Cheap to clone; clones share the same per-collection feed registry, so a
/// collection name has at most one live network subscription per engine.
#[derive(Clone)]
pub struct SyncEngine {
    feed: Arc<dyn RemoteFeed>,
    collections: Registry,
}

impl SyncEngine {
    pub fn new(feed: Arc<dyn RemoteFeed>) -> Self {
        Self {
            feed,
            collections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach to the live mirror of `collection`.
    ///
    /// The first subscriber establishes the underlying feed; later
    /// subscribers share it. Subscribing again after the feed was lost
    /// establishes a fresh feed; handles attached before the loss keep
    /// serving their stale mirror. The feed is torn down when the last
    /// [`MirrorHandle`] for the name is dropped.
    pub async fn subscribe(&self, collection: &str) -> Result<MirrorHandle> {
        let collection = normalize_collection(collection)?;

        if let Some(handle) = self.attach_existing(&collection) {
            return Ok(handle);
        }

        // No live entry: establish the feed outside the registry lock, then
        // re-check in case another subscriber won the race meanwhile.
        let feed = self.feed.subscribe_collection(&collection).await?;
        let mut entries = lock_registry(&self.collections);
        match entries.entry(collection.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.mirror_rx.borrow().status == MirrorStatus::Errored {
                    // the previous feed was lost; replace pump and channel,
                    // keeping the shared subscriber count for handles that
                    // still hold the stale mirror
                    entry.pump.abort();
                    let (mirror_tx, mirror_rx) = watch::channel(Mirror::initializing());
                    entry.pump = tokio::spawn(pump_feed(collection.clone(), feed, mirror_tx));
                    entry.mirror_rx = mirror_rx.clone();
                    entry.subscribers += 1;
                    info!(%collection, "live feed re-established");
                    Ok(MirrorHandle {
                        collection,
                        rx: mirror_rx,
                        registry: Arc::clone(&self.collections),
                    })
                } else {
                    drop(feed); // redundant subscription, unsubscribes
                    entry.subscribers += 1;
                    Ok(MirrorHandle {
                        collection,
                        rx: entry.mirror_rx.clone(),
                        registry: Arc::clone(&self.collections),
                    })
                }
            }
            Entry::Vacant(vacant) => {
                let (mirror_tx, mirror_rx) = watch::channel(Mirror::initializing());
                let pump = tokio::spawn(pump_feed(collection.clone(), feed, mirror_tx));
                vacant.insert(CollectionEntry {
                    mirror_rx: mirror_rx.clone(),
                    subscribers: 1,
                    pump,
                });
                info!(%collection, "live feed established");
                Ok(MirrorHandle {
                    collection,
                    rx: mirror_rx,
                    registry: Arc::clone(&self.collections),
                })
            }
        }
    }

    fn attach_existing(&self, collection: &str) -> Option<MirrorHandle> {
        let mut entries = lock_registry(&self.collections);
        let entry = entries.get_mut(collection)?;
        if entry.mirror_rx.borrow().status == MirrorStatus::Errored {
            // dead feed; force re-establishment instead of attaching
            return None;
        }
        entry.subscribers += 1;
        Some(MirrorHandle {
            collection: collection.to_string(),
            rx: entry.mirror_rx.clone(),
            registry: Arc::clone(&self.collections),
        })
    }

    /// Number of local subscribers currently attached to `collection`.
    #[must_use]
    pub fn subscribers(&self, collection: &str) -> usize {
        lock_registry(&self.collections)
            .get(collection)
            .map_or(0, |entry| entry.subscribers)
    }

    /// Create a document from `fields`, stamping both timestamps to now.
    ///
    /// No optimistic local row is synthesized; the mirror updates once the
    /// feed echoes the authoritative snapshot.
    pub async fn create(&self, collection: &str, fields: Fields) -> Result<DocumentId> {
        let collection = normalize_collection(collection)?;
        let draft = DocumentDraft::new(fields);
        let id = self.feed.create_doc(&collection, draft).await?;
        debug!(%collection, id = %id, "create submitted");
        Ok(id)
    }

    /// Partially replace a document's fields, re-stamping `updated_at`.
    pub async fn update(&self, collection: &str, id: &DocumentId, fields: Fields) -> Result<()> {
        let collection = normalize_collection(collection)?;
        let patch = DocumentPatch::new(fields);
        self.feed.update_doc(&collection, id, patch).await?;
        debug!(%collection, id = %id, "update submitted");
        Ok(())
    }

    /// Delete a document. Removing an already-absent id is not an error.
    pub async fn remove(&self, collection: &str, id: &DocumentId) -> Result<()> {
        let collection = normalize_collection(collection)?;
        match self.feed.delete_doc(&collection, id).await {
            Ok(()) => Ok(()),
            Err(Error::NotFound(_)) => {
                debug!(%collection, id = %id, "remove of absent id, treated as success");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// One-shot listing straight from the remote store, bypassing the mirror.
    pub async fn list(&self, collection: &str, query: ListQuery) -> Result<Vec<Document>> {
        let collection = normalize_collection(collection)?;
        self.feed.list_docs(&collection, query).await
    }
}

/// Shared handle on one live mirror.
///
/// Cloning attaches another subscriber to the same underlying feed. Dropping
/// the last handle for a collection tears the feed down.
pub struct MirrorHandle {
    collection: String,
    rx: watch::Receiver<Mirror>,
    registry: Registry,
}

impl MirrorHandle {
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The mirror as of the latest applied snapshot.
    #[must_use]
    pub fn current(&self) -> Mirror {
        self.rx.borrow().clone()
    }

    /// Wait until the next snapshot (or feed failure) is applied and return
    /// the resulting mirror. Slow readers observe the latest mirror rather
    /// than every intermediate one; the newest snapshot always wins anyway.
    pub async fn changed(&mut self) -> Result<Mirror> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Subscription("mirror closed".to_string()))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

impl Clone for MirrorHandle {
    fn clone(&self) -> Self {
        if let Some(entry) = lock_registry(&self.registry).get_mut(&self.collection) {
            entry.subscribers += 1;
        }
        Self {
            collection: self.collection.clone(),
            rx: self.rx.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for MirrorHandle {
    fn drop(&mut self) {
        let mut entries = lock_registry(&self.registry);
        let Some(entry) = entries.get_mut(&self.collection) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers == 0 {
            let entry = entries
                .remove(&self.collection)
                .expect("entry present above");
            entry.pump.abort();
            info!(collection = %self.collection, "last subscriber detached, feed torn down");
        }
    }
}

/// Applies feed events to the mirror, strictly in arrival order.
async fn pump_feed(collection: String, mut feed: CollectionFeed, mirror_tx: watch::Sender<Mirror>) {
    loop {
        match feed.next_event().await {
            Some(FeedEvent::Snapshot(mut documents)) => {
                sort_newest_first(&mut documents);
                debug!(%collection, count = documents.len(), "snapshot applied");
                mirror_tx.send_modify(|mirror| {
                    mirror.documents = documents;
                    mirror.status = MirrorStatus::Synced;
                    mirror.error = None;
                });
            }
            Some(FeedEvent::Lost(reason)) => {
                warn!(%collection, %reason, "live feed lost");
                mirror_tx.send_modify(|mirror| {
                    mirror.status = MirrorStatus::Errored;
                    mirror.error = Some(reason);
                });
                break;
            }
            None => {
                warn!(%collection, "live feed closed without notice");
                mirror_tx.send_modify(|mirror| {
                    mirror.status = MirrorStatus::Errored;
                    mirror.error = Some("feed closed without notice".to_string());
                });
                break;
            }
        }
    }
    drop(feed);
    // Keep serving the stale-but-available mirror until the last subscriber
    // detaches; retry policy belongs to the caller.
    std::future::pending::<()>().await;
}

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<String, CollectionEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::feed::MemoryFeed;

    use super::*;

    fn engine() -> (SyncEngine, MemoryFeed) {
        let feed = MemoryFeed::new();
        (SyncEngine::new(Arc::new(feed.clone())), feed)
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    /// Await mirror states until `predicate` holds. Panics after 5 seconds.
    async fn wait_for(
        handle: &mut MirrorHandle,
        predicate: impl Fn(&Mirror) -> bool,
    ) -> Mirror {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut mirror = handle.current();
            while !predicate(&mirror) {
                mirror = handle.changed().await.expect("mirror closed while waiting");
            }
            mirror
        })
        .await
        .expect("mirror never reached expected state")
    }

    #[tokio::test]
    async fn first_snapshot_moves_initializing_to_synced() {
        let (engine, _feed) = engine();
        let mut handle = engine.subscribe("docs").await.unwrap();

        let mirror = wait_for(&mut handle, |m| m.status == MirrorStatus::Synced).await;
        assert!(mirror.is_empty());
        assert_eq!(mirror.error, None);
    }

    #[tokio::test]
    async fn created_document_appears_once_echoed_with_equal_timestamps() {
        let (engine, _feed) = engine();
        let mut handle = engine.subscribe("docs").await.unwrap();

        let id = engine
            .create("docs", fields(&[("title", json!("Invoice"))]))
            .await
            .unwrap();

        let mirror = wait_for(&mut handle, |m| m.get(&id).is_some()).await;
        let doc = mirror.get(&id).unwrap();
        assert_eq!(doc.title(), "Invoice");
        assert_eq!(doc.created_at, doc.updated_at);
    }

    #[tokio::test]
    async fn update_advances_updated_at_and_keeps_created_at() {
        let (engine, _feed) = engine();
        let mut handle = engine.subscribe("docs").await.unwrap();
        let id = engine
            .create("docs", fields(&[("title", json!("v1"))]))
            .await
            .unwrap();
        let created = wait_for(&mut handle, |m| m.get(&id).is_some()).await;
        let before = created.get(&id).unwrap().clone();

        engine
            .update("docs", &id, fields(&[("title", json!("v2"))]))
            .await
            .unwrap();

        let mirror = wait_for(&mut handle, |m| {
            m.get(&id).is_some_and(|d| d.title() == "v2")
        })
        .await;
        let after = mirror.get(&id).unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn update_of_missing_id_fails_with_not_found() {
        let (engine, _feed) = engine();
        let id: DocumentId = "ghost".parse().unwrap();
        let err = engine.update("docs", &id, Fields::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (engine, _feed) = engine();
        let mut handle = engine.subscribe("docs").await.unwrap();
        let id = engine.create("docs", Fields::new()).await.unwrap();
        wait_for(&mut handle, |m| m.get(&id).is_some()).await;

        engine.remove("docs", &id).await.unwrap();
        wait_for(&mut handle, |m| m.is_empty()).await;

        // second removal of the same id, and removal of a never-seen id
        engine.remove("docs", &id).await.unwrap();
        engine
            .remove("docs", &"never-existed".parse().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshots_replace_the_mirror_and_order_newest_first() {
        let (engine, feed) = engine();

        // seed with explicit timestamps, oldest written last
        feed.create_doc("docs", DocumentDraft::stamped(fields(&[("n", json!("b"))]), 200))
            .await
            .unwrap();
        feed.create_doc("docs", DocumentDraft::stamped(fields(&[("n", json!("a"))]), 100))
            .await
            .unwrap();
        let newest = feed
            .create_doc("docs", DocumentDraft::stamped(fields(&[("n", json!("c"))]), 300))
            .await
            .unwrap();

        let mut handle = engine.subscribe("docs").await.unwrap();
        let mirror = wait_for(&mut handle, |m| m.len() == 3).await;
        let stamps: Vec<i64> = mirror.documents.iter().map(|d| d.created_at).collect();
        assert_eq!(stamps, vec![300, 200, 100]);

        // removal: the next snapshot replaces content, nothing is merged
        engine.remove("docs", &newest).await.unwrap();
        let mirror = wait_for(&mut handle, |m| m.len() == 2).await;
        let stamps: Vec<i64> = mirror.documents.iter().map(|d| d.created_at).collect();
        assert_eq!(stamps, vec![200, 100]);
    }

    #[tokio::test]
    async fn subscribers_share_one_feed_and_teardown_is_refcounted() {
        let (engine, _feed) = engine();

        let mut first = engine.subscribe("docs").await.unwrap();
        let second = engine.subscribe("docs").await.unwrap();
        let third = second.clone();
        assert_eq!(engine.subscribers("docs"), 3);

        let id = engine.create("docs", Fields::new()).await.unwrap();
        let mirror = wait_for(&mut first, |m| m.get(&id).is_some()).await;
        assert_eq!(second.current(), mirror);

        drop(second);
        drop(third);
        assert_eq!(engine.subscribers("docs"), 1);
        drop(first);
        assert_eq!(engine.subscribers("docs"), 0);

        // a later subscription establishes a fresh feed
        let mut again = engine.subscribe("docs").await.unwrap();
        let mirror = wait_for(&mut again, |m| m.status == MirrorStatus::Synced).await;
        assert_eq!(mirror.len(), 1);
    }

    #[tokio::test]
    async fn feed_loss_marks_errored_and_keeps_stale_documents() {
        let (engine, feed) = engine();
        let mut handle = engine.subscribe("docs").await.unwrap();
        let id = engine.create("docs", Fields::new()).await.unwrap();
        wait_for(&mut handle, |m| m.get(&id).is_some()).await;

        feed.drop_collection_feed("docs", "backend restart");
        let mirror = wait_for(&mut handle, |m| m.status == MirrorStatus::Errored).await;
        assert_eq!(mirror.error.as_deref(), Some("backend restart"));
        assert!(mirror.get(&id).is_some(), "stale mirror must be retained");
    }

    #[tokio::test]
    async fn resubscribing_after_feed_loss_establishes_a_fresh_feed() {
        let (engine, feed) = engine();
        let mut first = engine.subscribe("docs").await.unwrap();
        let second = engine.subscribe("docs").await.unwrap();

        feed.drop_collection_feed("docs", "backend restart");
        wait_for(&mut first, |m| m.status == MirrorStatus::Errored).await;

        // retry while another handle still holds the dead entry
        drop(first);
        let mut retried = engine.subscribe("docs").await.unwrap();
        assert_eq!(engine.subscribers("docs"), 2);

        let id = engine.create("docs", Fields::new()).await.unwrap();
        let mirror = wait_for(&mut retried, |m| m.get(&id).is_some()).await;
        assert_eq!(mirror.status, MirrorStatus::Synced);

        // the surviving pre-loss handle keeps its stale errored mirror
        assert_eq!(second.current().status, MirrorStatus::Errored);

        drop(second);
        drop(retried);
        assert_eq!(engine.subscribers("docs"), 0);
    }

    #[tokio::test]
    async fn list_bypasses_the_mirror() {
        let (engine, _feed) = engine();
        engine
            .create("docs", fields(&[("status", json!("draft"))]))
            .await
            .unwrap();

        let docs = engine
            .list("docs", ListQuery::default().where_field_eq("status", json!("draft")))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn blank_collection_names_are_rejected() {
        let (engine, _feed) = engine();
        assert!(engine.subscribe(" ").await.is_err());
        assert!(engine.create("", Fields::new()).await.is_err());
    }
}
