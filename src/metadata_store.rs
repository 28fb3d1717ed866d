use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Caller-defined tag map attached to every chunk (e.g. `patient_id`,
/// `condition`, `visit_year`). The schema is opaque to the index.
pub type Tags = serde_json::Map<String, serde_json::Value>;

/// A unit of source text plus its provenance tags.
/// Persisted as `{"text": ..., "meta": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    #[serde(rename = "meta", default)]
    pub tags: Tags,
}

impl Chunk {
    pub fn new(text: impl Into<String>, tags: Tags) -> Self {
        Self {
            text: text.into(),
            tags,
        }
    }
}

/// Ordered chunk records, positionally aligned with the vector store.
#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
    records: Vec<Chunk>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<Chunk>) -> Self {
        Self { records }
    }

    pub fn append(&mut self, records: Vec<Chunk>) {
        self.records.extend(records);
    }

    pub fn get(&self, position: usize) -> Result<&Chunk, IndexError> {
        self.records
            .get(position)
            .ok_or(IndexError::IndexOutOfRange {
                position,
                len: self.records.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.records.iter()
    }

    pub fn records(&self) -> &[Chunk] {
        &self.records
    }

    /// Exact count of records whose tags satisfy `predicate`.
    pub fn count_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Tags) -> bool,
    {
        self.records.iter().filter(|c| predicate(&c.tags)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(value: serde_json::Value) -> Tags {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_append_preserves_order_and_duplicates() {
        let mut store = MetadataStore::new();
        store.append(vec![
            Chunk::new("first", Tags::new()),
            Chunk::new("second", Tags::new()),
        ]);
        store.append(vec![Chunk::new("first", Tags::new())]);

        assert_eq!(store.len(), 3);
        assert_eq!(store.get(0).unwrap().text, "first");
        assert_eq!(store.get(1).unwrap().text, "second");
        assert_eq!(store.get(2).unwrap().text, "first");
    }

    #[test]
    fn test_get_out_of_range() {
        let store = MetadataStore::from_records(vec![Chunk::new("only", Tags::new())]);
        assert!(matches!(
            store.get(1),
            Err(IndexError::IndexOutOfRange {
                position: 1,
                len: 1
            })
        ));
    }

    #[test]
    fn test_count_where_scans_every_record() {
        let store = MetadataStore::from_records(vec![
            Chunk::new("a", tags(json!({"condition": "asthma"}))),
            Chunk::new("b", tags(json!({"condition": "diabetes"}))),
            Chunk::new("c", tags(json!({"condition": "asthma"}))),
            Chunk::new("d", Tags::new()),
        ]);
        let count = store.count_where(|t| t.get("condition") == Some(&json!("asthma")));
        assert_eq!(count, 2);
    }

    #[test]
    fn test_chunk_serializes_tags_as_meta() {
        let chunk = Chunk::new("Patient B has asthma.", tags(json!({"condition": "asthma"})));
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(
            value,
            json!({"text": "Patient B has asthma.", "meta": {"condition": "asthma"}})
        );

        let parsed: Chunk = serde_json::from_value(json!({"text": "no tags"})).unwrap();
        assert!(parsed.tags.is_empty());
    }
}
