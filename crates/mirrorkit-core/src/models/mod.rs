//! Data models for Mirrorkit

mod document;

pub use document::{
    sort_newest_first, Document, DocumentDraft, DocumentId, DocumentPatch, Fields,
    RECENT_WINDOW_MS,
};
