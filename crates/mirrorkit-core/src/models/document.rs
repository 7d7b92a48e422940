//! Document model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Caller-defined document fields: an open mapping with unique keys.
pub type Fields = serde_json::Map<String, Value>;

/// How far back a document still counts as "recent activity" (24 hours, ms).
pub const RECENT_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// An opaque document identifier assigned by the remote store on creation.
///
/// The sync engine never mints these locally; it only carries them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Get the string representation of this id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidInput(
                "Document id cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

/// A document in a remote collection, as reflected by the local mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier, immutable after creation
    pub id: DocumentId,
    /// Open caller-defined field mapping
    pub fields: Fields,
    /// Creation timestamp (Unix ms), set exactly once
    pub created_at: i64,
    /// Last accepted mutation timestamp (Unix ms), monotonically non-decreasing
    pub updated_at: i64,
}

impl Document {
    /// Look up a named field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    fn text_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// The `title` field, or an empty string when absent or non-textual
    #[must_use]
    pub fn title(&self) -> &str {
        self.text_field("title").unwrap_or("")
    }

    /// The `content` field, or an empty string when absent or non-textual
    #[must_use]
    pub fn content(&self) -> &str {
        self.text_field("content").unwrap_or("")
    }

    /// The `status` field, when present and textual
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.text_field("status")
    }

    /// Whether the document was created within the trailing 24-hour window
    /// ending at `now_ms`. Evaluated against the caller's clock at read time.
    #[must_use]
    pub const fn is_recent(&self, now_ms: i64) -> bool {
        self.created_at > now_ms - RECENT_WINDOW_MS
    }
}

/// What `create` submits to the remote store.
///
/// Both timestamps are stamped to the same instant; the remote store assigns
/// the id and echoes the document back through the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDraft {
    pub fields: Fields,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DocumentDraft {
    /// Build a draft stamped with the current wall-clock time
    #[must_use]
    pub fn new(fields: Fields) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self::stamped(fields, now)
    }

    /// Build a draft with an explicit creation instant
    #[must_use]
    pub const fn stamped(fields: Fields, now_ms: i64) -> Self {
        Self {
            fields,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Materialize the draft into a document once the store assigned an id
    #[must_use]
    pub fn into_document(self, id: DocumentId) -> Document {
        Document {
            id,
            fields: self.fields,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What `update` submits: a partial field replacement plus a fresh
/// `updated_at`. Fields absent from the patch keep their stored values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub fields: Fields,
    pub updated_at: i64,
}

impl DocumentPatch {
    /// Build a patch stamped with the current wall-clock time
    #[must_use]
    pub fn new(fields: Fields) -> Self {
        Self {
            fields,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Sort documents by `created_at` descending (newest first), with ties broken
/// by id so the order is total and independent of arrival order.
pub fn sort_newest_first(documents: &mut [Document]) {
    documents.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
