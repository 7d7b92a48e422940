//! mirrorkit-core - Core library for Mirrorkit
//!
//! Client-side layer that keeps local mirrors of remote, multi-writer
//! document collections continuously synchronized with a live backend feed,
//! issues create/update/delete mutations against that feed, and tracks
//! resumable binary uploads with progress reporting and cancellation.
//!
//! The remote store itself sits behind the [`feed::RemoteFeed`] trait;
//! transport, persistence format, and authentication are the backend's
//! concern. UI layers consume the [`sync::MirrorHandle`] read model, the
//! [`upload::UploadSession`] observable, and the pure projections in
//! [`view`].

pub mod config;
pub mod error;
pub mod feed;
pub mod models;
pub mod sync;
pub mod upload;
pub mod view;

pub use config::FeedConfig;
pub use error::{Error, Result};
pub use models::{Document, DocumentId, Fields};
pub use sync::{Mirror, MirrorHandle, MirrorStatus, SyncEngine};
pub use upload::{UploadEngine, UploadSession, UploadState};
