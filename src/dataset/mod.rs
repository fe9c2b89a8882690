pub mod diff;
pub mod export;

use serde::{Serialize, Deserialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// Re-export common types
pub use diff::{diff_datasets, ChangedItem, DatasetDiff};
pub use export::{export_dataset, import_json, ExportFormat};

/// One record extracted from a crawled page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetItem {
    pub url: String,
    pub content_hash: String,
    pub payload: Value,
}

impl DatasetItem {
    /// Build an item, hashing the payload
    pub fn new(url: &str, payload: Value) -> Self {
        Self {
            url: url.to_string(),
            content_hash: content_hash(&payload),
            payload,
        }
    }
}

/// SHA-256 hex digest of the canonical JSON form of a payload.
///
/// serde_json maps keep their keys sorted, so equal payloads hash equally
/// regardless of construction order.
pub fn content_hash(payload: &Value) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Collection of items produced by one job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub items: Vec<DatasetItem>,
    pub item_count: usize,
    pub total_bytes: u64,
}

impl Dataset {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn from_items(id: &str, items: Vec<DatasetItem>) -> Self {
        let mut dataset = Self::new(id);
        for item in items {
            dataset.push(item);
        }
        dataset
    }

    pub fn push(&mut self, item: DatasetItem) {
        self.total_bytes += serde_json::to_string(&item.payload)
            .map(|s| s.len() as u64)
            .unwrap_or(0);
        self.items.push(item);
        self.item_count = self.items.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_order_independent() {
        let a = json!({"title": "x", "words": 3});
        let b: Value = serde_json::from_str(r#"{"words": 3, "title": "x"}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"title": "y", "words": 3})));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn test_dataset_counters() {
        let dataset = Dataset::from_items(
            "d1",
            vec![
                DatasetItem::new("https://a.com", json!({"t": 1})),
                DatasetItem::new("https://b.com", json!({"t": 2})),
            ],
        );
        assert_eq!(dataset.item_count, 2);
        assert_eq!(dataset.total_bytes, 14);
    }
}
