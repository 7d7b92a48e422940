//! View projection over a mirror.
//!
//! Pure functions only: no side effects, no network, fully deterministic
//! given their inputs. Presentation layers call these on every render.

use serde::{Deserialize, Serialize};

use crate::models::Document;

/// Which document statuses a projection keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Only(String),
}

impl StatusFilter {
    /// Whether `document` passes this filter.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Only(status) => document.status() == Some(status.as_str()),
        }
    }
}

impl From<&str> for StatusFilter {
    /// `"all"` (any casing) and blank input mean no filtering.
    fn from(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            Self::All
        } else {
            Self::Only(raw.to_string())
        }
    }
}

/// Filter `documents` by search term and status.
///
/// A document matches when the term is empty or appears case-insensitively in
/// its title or content, and its status passes `filter`. Input order is
/// preserved, so projecting a mirror keeps its newest-first ordering.
#[must_use]
pub fn project(documents: &[Document], search_term: &str, filter: &StatusFilter) -> Vec<Document> {
    let needle = search_term.to_lowercase();
    documents
        .iter()
        .filter(|doc| matches_search(doc, &needle) && filter.matches(doc))
        .cloned()
        .collect()
}

fn matches_search(document: &Document, needle: &str) -> bool {
    needle.is_empty()
        || document.title().to_lowercase().contains(needle)
        || document.content().to_lowercase().contains(needle)
}

/// Headline numbers for a collection, derived at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total_documents: usize,
    /// Documents created within the trailing 24 hours of `now_ms`.
    pub recent_activity: usize,
}

/// Compute [`CollectionStats`] against the caller's clock.
///
/// Recency is always evaluated against `now_ms` at the moment of the call,
/// never against snapshot arrival time, so the same mirror can age out of
/// "recent" without any feed traffic.
#[must_use]
pub fn stats(documents: &[Document], now_ms: i64) -> CollectionStats {
    CollectionStats {
        total_documents: documents.len(),
        recent_activity: documents
            .iter()
            .filter(|doc| doc.is_recent(now_ms))
            .count(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::models::{Fields, RECENT_WINDOW_MS};

    use super::*;

    fn doc(id: &str, title: &str, content: &str, status: &str, created_at: i64) -> Document {
        let mut fields = Fields::new();
        fields.insert("title".to_string(), json!(title));
        fields.insert("content".to_string(), json!(content));
        fields.insert("status".to_string(), json!(status));
        Document {
            id: id.parse().unwrap(),
            fields,
            created_at,
            updated_at: created_at,
        }
    }

    fn sample() -> Vec<Document> {
        vec![
            doc("b", "Report", "Quarterly numbers", "published", 200),
            doc("a", "Invoice", "March invoice", "draft", 100),
        ]
    }

    #[test]
    fn empty_term_and_all_filter_is_the_identity() {
        let docs = sample();
        assert_eq!(project(&docs, "", &StatusFilter::All), docs);
    }

    #[test]
    fn search_matches_title_or_content_case_insensitively() {
        let docs = sample();

        let hits = project(&docs, "inv", &StatusFilter::All);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "a");

        let hits = project(&docs, "QUARTERLY", &StatusFilter::All);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "b");

        assert!(project(&docs, "missing", &StatusFilter::All).is_empty());
    }

    #[test]
    fn status_filter_keeps_only_matching_documents() {
        let docs = sample();
        let hits = project(&docs, "", &StatusFilter::Only("published".to_string()));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "b");
    }

    #[test]
    fn search_and_status_compose() {
        let docs = sample();
        assert!(project(&docs, "inv", &StatusFilter::Only("published".to_string())).is_empty());
        let hits = project(&docs, "inv", &StatusFilter::Only("draft".to_string()));
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn projection_preserves_input_order() {
        let docs = sample();
        let hits = project(&docs, "", &StatusFilter::All);
        let ids: Vec<&str> = hits.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn status_filter_parses_all_and_specific_values() {
        assert_eq!(StatusFilter::from("all"), StatusFilter::All);
        assert_eq!(StatusFilter::from(" ALL "), StatusFilter::All);
        assert_eq!(StatusFilter::from(""), StatusFilter::All);
        assert_eq!(
            StatusFilter::from("draft"),
            StatusFilter::Only("draft".to_string())
        );
    }

    #[test]
    fn documents_without_text_fields_never_match_a_term() {
        let bare = Document {
            id: "x".parse().unwrap(),
            fields: Fields::new(),
            created_at: 1,
            updated_at: 1,
        };
        assert!(project(&[bare.clone()], "anything", &StatusFilter::All).is_empty());
        // but they survive the identity projection
        assert_eq!(project(&[bare.clone()], "", &StatusFilter::All), vec![bare]);
    }

    #[test]
    fn stats_count_recency_against_the_read_clock() {
        let now = 100 * RECENT_WINDOW_MS;
        let docs = vec![
            doc("a", "", "", "draft", now - 10),
            doc("b", "", "", "draft", now - RECENT_WINDOW_MS + 1),
            doc("c", "", "", "draft", now - RECENT_WINDOW_MS),
        ];

        let stats_now = stats(&docs, now);
        assert_eq!(stats_now.total_documents, 3);
        assert_eq!(stats_now.recent_activity, 2);

        // the same mirror ages out as the clock advances
        let later = stats(&docs, now + RECENT_WINDOW_MS);
        assert_eq!(later.recent_activity, 0);
    }
}
