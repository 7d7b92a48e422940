//! Upload engine.
//!
//! Drives resumable transfers against the remote feed and tracks each one as
//! an [`UploadSession`] state machine: `Uploading` then exactly one of
//! `Succeeded`, `Failed`, or `Cancelled`. Terminal states are absorbing.
//! Progress is exposed as a finite, take-once stream of percentages computed
//! from transport-reported byte counts. After the bytes land, the durable
//! retrieval URL is resolved as a separate step; that step can fail on its
//! own, which surfaces as a distinct failure cause.

use std::sync::Arc;

use thiserror::Error as ThisError;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::feed::{RemoteFeed, TransferEvent, TransferHandle};

/// Why an upload ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum UploadError {
    /// The bytes could not be sent.
    #[error("transfer failed: {0}")]
    Transfer(String),
    /// The bytes were fully transferred but no durable URL could be obtained.
    #[error("transfer ok, URL resolution failed: {0}")]
    UrlResolution(String),
}

/// Lifecycle of one upload session. Terminal states are absorbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Uploading,
    /// All bytes landed and a durable retrieval URL was resolved.
    Succeeded(String),
    Failed(UploadError),
    Cancelled,
}

impl UploadState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Uploading)
    }

    /// The resolved URL, when the session succeeded.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Succeeded(url) => Some(url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProgressCell {
    pct: u8,
    done: bool,
}

/// Finite stream of progress percentages in `[0, 100]`.
///
/// Values are non-decreasing; slow consumers skip straight to the latest
/// value. The stream ends after the session reaches a terminal state and the
/// final percentage has been observed.
pub struct ProgressStream {
    cells: WatchStream<ProgressCell>,
    last: Option<u8>,
    finished: bool,
}

impl ProgressStream {
    fn new(rx: watch::Receiver<ProgressCell>) -> Self {
        Self {
            cells: WatchStream::new(rx),
            last: None,
            finished: false,
        }
    }

    /// The next distinct percentage, or `None` once the sequence is over.
    pub async fn next(&mut self) -> Option<u8> {
        while !self.finished {
            let Some(cell) = self.cells.next().await else {
                self.finished = true;
                break;
            };
            if cell.done {
                self.finished = true;
            }
            if self.last != Some(cell.pct) {
                self.last = Some(cell.pct);
                return Some(cell.pct);
            }
        }
        None
    }

    /// Drain the remaining sequence into a vector (mainly for tests/demos).
    pub async fn collect(mut self) -> Vec<u8> {
        let mut all = Vec::new();
        while let Some(pct) = self.next().await {
            all.push(pct);
        }
        all
    }
}

/// One resumable transfer from start to terminal state.
pub struct UploadSession {
    path: String,
    state_rx: watch::Receiver<UploadState>,
    progress_rx: Option<watch::Receiver<ProgressCell>>,
    cancel: watch::Sender<bool>,
}

impl UploadSession {
    /// Target path of this upload.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> UploadState {
        self.state_rx.borrow().clone()
    }

    /// Take the progress stream. Non-restartable: `None` after the first take.
    pub fn progress(&mut self) -> Option<ProgressStream> {
        self.progress_rx.take().map(ProgressStream::new)
    }

    /// Cancel an uploading session. No-op once terminal. Cooperative: bytes
    /// already sent stay sent, but no URL will ever be produced.
    pub fn cancel(&self) {
        if !self.state().is_terminal() {
            let _ = self.cancel.send(true);
        }
    }

    /// Wait for the terminal state.
    pub async fn wait(&mut self) -> UploadState {
        loop {
            let state = self.state_rx.borrow_and_update().clone();
            if state.is_terminal() {
                return state;
            }
            if self.state_rx.changed().await.is_err() {
                let state = self.state_rx.borrow().clone();
                return if state.is_terminal() {
                    state
                } else {
                    UploadState::Failed(UploadError::Transfer(
                        "upload task stopped unexpectedly".to_string(),
                    ))
                };
            }
        }
    }
}

/// Upload engine over one remote feed client.
///
/// Sessions are independent; concurrent uploads never share state.
#[derive(Clone)]
pub struct UploadEngine {
    feed: Arc<dyn RemoteFeed>,
}

impl UploadEngine {
    pub fn new(feed: Arc<dyn RemoteFeed>) -> Self {
        Self { feed }
    }

    /// Begin a resumable transfer of `bytes` to `target_path`.
    ///
    /// The transfer starts immediately; the returned session observes it.
    pub async fn upload(&self, bytes: Vec<u8>, target_path: &str) -> Result<UploadSession> {
        let path = normalize_object_path(target_path)?;
        let transfer = self.feed.start_upload(&path, bytes).await?;

        let (state_tx, state_rx) = watch::channel(UploadState::Uploading);
        let (progress_tx, progress_rx) = watch::channel(ProgressCell {
            pct: 0,
            done: false,
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);

        debug!(%path, "upload started");
        tokio::spawn(drive(
            Arc::clone(&self.feed),
            path.clone(),
            transfer,
            state_tx,
            progress_tx,
            cancel_rx,
        ));

        Ok(UploadSession {
            path,
            state_rx,
            progress_rx: Some(progress_rx),
            cancel: cancel_tx,
        })
    }

    /// Resolve the durable retrieval URL of an already-uploaded object.
    pub async fn download_url(&self, path: &str) -> Result<String> {
        let path = normalize_object_path(path)?;
        self.feed.resolve_download_url(&path).await
    }

    /// Delete an uploaded object.
    pub async fn remove_object(&self, path: &str) -> Result<()> {
        let path = normalize_object_path(path)?;
        self.feed.delete_object(&path).await
    }
}

/// Consumes transfer events, publishes progress and the terminal state.
async fn drive(
    feed: Arc<dyn RemoteFeed>,
    path: String,
    mut transfer: TransferHandle,
    state_tx: watch::Sender<UploadState>,
    progress_tx: watch::Sender<ProgressCell>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut last_pct = 0u8;
    let mut cancel_open = true;
    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed(), if cancel_open => {
                match changed {
                    Ok(()) if *cancel_rx.borrow() => {
                        transfer.cancel();
                        progress_tx.send_modify(|cell| cell.done = true);
                        let _ = state_tx.send(UploadState::Cancelled);
                        info!(%path, "upload cancelled");
                        return;
                    }
                    Ok(()) => {}
                    // session dropped without cancelling: finish the transfer
                    Err(_) => cancel_open = false,
                }
            }
            event = transfer.next_event() => match event {
                Some(TransferEvent::Progress { transferred, total }) => {
                    let pct = percent(transferred, total);
                    if pct > last_pct {
                        last_pct = pct;
                        progress_tx.send_modify(|cell| cell.pct = pct);
                    }
                }
                Some(TransferEvent::Completed) => {
                    progress_tx.send_modify(|cell| {
                        cell.pct = 100;
                        cell.done = true;
                    });
                    // bytes landed; the durable URL is a separate network step
                    match feed.resolve_download_url(&path).await {
                        Ok(url) => {
                            info!(%path, "upload succeeded");
                            let _ = state_tx.send(UploadState::Succeeded(url));
                        }
                        Err(error) => {
                            let reason = match error {
                                Error::UrlResolution(reason) => reason,
                                other => other.to_string(),
                            };
                            warn!(%path, %reason, "upload transferred but URL resolution failed");
                            let _ = state_tx
                                .send(UploadState::Failed(UploadError::UrlResolution(reason)));
                        }
                    }
                    return;
                }
                Some(TransferEvent::Failed(reason)) => {
                    progress_tx.send_modify(|cell| cell.done = true);
                    warn!(%path, %reason, "upload transfer failed");
                    let _ = state_tx.send(UploadState::Failed(UploadError::Transfer(reason)));
                    return;
                }
                None => {
                    progress_tx.send_modify(|cell| cell.done = true);
                    warn!(%path, "transport stopped without a terminal event");
                    let _ = state_tx.send(UploadState::Failed(UploadError::Transfer(
                        "transport stopped without a terminal event".to_string(),
                    )));
                    return;
                }
            }
        }
    }
}

/// Percentage of `transferred` over `total`, clamped to `[0, 100]`.
/// An empty transfer is complete by definition.
#[allow(clippy::cast_possible_truncation)] // quotient is at most 100
const fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let clamped = if transferred > total {
        total
    } else {
        transferred
    };
    ((clamped * 100) / total) as u8
}

/// Build a timestamped object key under `prefix` from a raw file name.
///
/// The file name is lowercased and reduced to ASCII alphanumerics with `-`
/// separators, keeping its extension, so keys stay portable across backends.
pub fn object_key(prefix: &str, file_name: &str) -> Result<String> {
    let prefix = prefix.trim().trim_matches('/');
    if prefix.is_empty() {
        return Err(Error::InvalidInput(
            "Object key prefix cannot be empty".to_string(),
        ));
    }
    let name = sanitize_file_name(file_name);
    let ts = chrono::Utc::now().timestamp_millis();
    Ok(format!("{prefix}/{ts}-{name}"))
}

fn sanitize_file_name(file_name: &str) -> String {
    let trimmed = file_name.trim().trim_matches('/');
    let (stem, extension) = match trimmed.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (trimmed, None),
    };
    let stem = match slug(stem) {
        s if s.is_empty() => "file".to_string(),
        s => s,
    };
    match extension.map(slug).filter(|e| !e.is_empty()) {
        Some(extension) => format!("{stem}.{extension}"),
        None => stem,
    }
}

fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
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
