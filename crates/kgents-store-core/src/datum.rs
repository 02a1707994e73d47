//! The atomic unit of persisted data.
//!
//! Schema-free by design: a [`Datum`] is raw bytes with an identity, a
//! timestamp, an optional causal link, and free-form string metadata.

use core::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{clock, Metadata, StoreError};

/// The atomic unit of persisted data.
///
/// Datums are immutable values: an "update" stores a new datum under the
/// same id and the backend replaces the old one. Identity is either a
/// fresh random token or, for content-addressed datums, the SHA-256 hex
/// of the content, so two content-addressed datums with identical bytes
/// share one id.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Random token or SHA-256 content hash.
    pub id: String,
    /// Raw payload bytes; base64 in the JSON form.
    #[serde(with = "content_encoding")]
    pub content: Vec<u8>,
    /// Seconds since the Unix epoch at construction.
    pub created_at: f64,
    /// Id of the datum that causally produced this one.
    #[serde(default)]
    pub causal_parent: Option<String>,
    /// Free-form string tags. `tags`, `author`, `source`, and `schema`
    /// are queryable via [`Query`](crate::Query).
    #[serde(default)]
    pub metadata: Metadata,
}

impl Datum {
    /// Create a datum with a fresh random id.
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            content: content.into(),
            created_at: clock::now(),
            causal_parent: None,
            metadata: Metadata::new(),
        }
    }

    /// Create a content-addressed datum whose id is the SHA-256 hex of
    /// its content. Identical content always yields an identical id.
    pub fn content_addressed(content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            id: hex::encode(Sha256::digest(&content)),
            content,
            created_at: clock::now(),
            causal_parent: None,
            metadata: Metadata::new(),
        }
    }

    /// Replace the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the causal parent.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.causal_parent = Some(parent.into());
        self
    }

    /// Return a copy with the given key-value pairs merged into the
    /// metadata. The original is unchanged.
    pub fn with_metadata<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.metadata
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Create a new datum that causally derives from this one: its
    /// `causal_parent` points at `self.id`.
    pub fn derive(&self, content: impl Into<Vec<u8>>) -> Self {
        Datum::new(content).with_parent(self.id.clone())
    }

    /// Size of the content in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Serialize to a JSON value with base64-encoded content.
    pub fn to_json(&self) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON value produced by [`to_json`](Self::to_json).
    pub fn from_json(value: serde_json::Value) -> Result<Self, StoreError> {
        serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Serialize to a single compact JSON line, newline-free.
    pub fn to_line(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Deserialize from a single JSON line.
    pub fn from_line(line: &str) -> Result<Self, StoreError> {
        serde_json::from_str(line).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

impl fmt::Debug for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id: String = self.id.chars().take(8).collect();
        let preview_len = self.content.len().min(20);
        let preview = String::from_utf8_lossy(&self.content[..preview_len]);
        let ellipsis = if self.content.len() > 20 { "..." } else { "" };
        write!(
            f,
            "Datum(id={id}..., content={preview:?}{ellipsis}, size={}B)",
            self.size()
        )
    }
}

mod content_encoding {
    //! Content bytes travel as base64 text in the JSON form; hex input is
    //! tolerated on decode.

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64
            .decode(text.as_bytes())
            .or_else(|_| hex::decode(&text))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_assigns_random_hex_id() {
        let d = Datum::new(b"hello".to_vec());
        assert_eq!(d.id.len(), 32);
        assert!(d.created_at > 0.0);
        assert!(d.causal_parent.is_none());
        assert!(d.metadata.is_empty());
    }

    #[test]
    fn content_addressed_ids_are_deterministic() {
        let a = Datum::content_addressed(b"hello".to_vec());
        let b = Datum::content_addressed(b"hello".to_vec());
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);

        let c = Datum::content_addressed(b"other".to_vec());
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn derive_links_to_parent() {
        let parent = Datum::new(b"root".to_vec());
        let child = parent.derive(b"leaf".to_vec());
        assert_eq!(child.causal_parent.as_deref(), Some(parent.id.as_str()));
        assert_ne!(child.id, parent.id);
    }

    #[test]
    fn with_metadata_merges_and_leaves_original_untouched() {
        let original = Datum::new(b"x".to_vec()).with_metadata([("a", "1")]);
        let extended = original.clone().with_metadata([("b", "2")]);

        assert_eq!(original.metadata.len(), 1);
        assert_eq!(extended.metadata.get("a").map(String::as_str), Some("1"));
        assert_eq!(extended.metadata.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn json_round_trip_is_exact() {
        let d = Datum::new(vec![0u8, 159, 146, 150])
            .with_parent("p-1")
            .with_metadata([("tags", "a,b"), ("author", "tester")]);

        let value = d.to_json().unwrap();
        assert_eq!(value["id"], serde_json::json!(d.id));
        assert!(value["content"].is_string());

        let back = Datum::from_json(value).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn line_round_trip_is_exact_and_single_line() {
        let d = Datum::content_addressed(b"line me".to_vec()).with_metadata([("schema", "note")]);
        let line = d.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(Datum::from_line(&line).unwrap(), d);
    }

    #[test]
    fn from_json_accepts_hex_content() {
        let value = serde_json::json!({
            "id": "abc",
            "content": hex::encode(b"hi!"),
            "created_at": 1.5,
            "causal_parent": null,
            "metadata": {}
        });
        // "686921" is not valid padded base64, so the hex fallback kicks in.
        let d = Datum::from_json(value).unwrap();
        assert_eq!(d.content, b"hi!");
    }

    #[test]
    fn size_matches_content_length() {
        let d = Datum::new(vec![1, 2, 3]);
        assert_eq!(d.size(), 3);
    }

    #[test]
    fn debug_truncates_long_content() {
        let d = Datum::new(vec![b'x'; 100]);
        let repr = format!("{d:?}");
        assert!(repr.contains("..."));
        assert!(repr.contains("size=100B"));
        assert!(!repr.contains(&"x".repeat(100)));
    }
}
