use std::collections::HashMap;

use serde::{Serialize, Deserialize};

use crate::dataset::DatasetItem;

/// An item present on both sides with a different content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedItem {
    pub url: String,
    pub old_hash: String,
    pub new_hash: String,
}

/// Difference between two crawls of the same target, every list sorted by URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<ChangedItem>,
}

impl DatasetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare `old` against `new` by URL and content hash.
///
/// Not commutative: `changed` reports the hash from `old` as `old_hash`.
pub fn diff_datasets(old: &[DatasetItem], new: &[DatasetItem]) -> DatasetDiff {
    let old_by_url: HashMap<&str, &str> = old
        .iter()
        .map(|item| (item.url.as_str(), item.content_hash.as_str()))
        .collect();
    let new_by_url: HashMap<&str, &str> = new
        .iter()
        .map(|item| (item.url.as_str(), item.content_hash.as_str()))
        .collect();

    let mut diff = DatasetDiff::default();

    for (url, new_hash) in &new_by_url {
        match old_by_url.get(url) {
            None => diff.added.push(url.to_string()),
            Some(old_hash) if old_hash != new_hash => diff.changed.push(ChangedItem {
                url: url.to_string(),
                old_hash: old_hash.to_string(),
                new_hash: new_hash.to_string(),
            }),
            Some(_) => {}
        }
    }

    for url in old_by_url.keys() {
        if !new_by_url.contains_key(url) {
            diff.removed.push(url.to_string());
        }
    }

    diff.added.sort();
    diff.removed.sort();
    diff.changed.sort_by(|a, b| a.url.cmp(&b.url));

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn item(url: &str, hash: &str) -> DatasetItem {
        DatasetItem {
            url: url.to_string(),
            content_hash: hash.to_string(),
            payload: Value::Null,
        }
    }

    #[test]
    fn test_added_and_removed() {
        let old = vec![item("a", "1"), item("b", "2")];
        let new = vec![item("b", "2"), item("c", "3")];

        let diff = diff_datasets(&old, &new);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_changed_hash() {
        let old = vec![item("a", "1"), item("b", "2")];
        let new = vec![item("b", "9"), item("c", "3")];

        let diff = diff_datasets(&old, &new);
        assert_eq!(
            diff.changed,
            vec![ChangedItem { url: "b".into(), old_hash: "2".into(), new_hash: "9".into() }]
        );

        // Swapping sides swaps the hashes
        let reversed = diff_datasets(&new, &old);
        assert_eq!(reversed.changed[0].old_hash, "9");
        assert_eq!(reversed.added, vec!["a"]);
    }

    #[test]
    fn test_output_is_sorted_regardless_of_input_order() {
        let old = vec![item("z", "1"), item("m", "1"), item("q", "1")];
        let new = vec![item("y", "1"), item("q", "2"), item("b", "1"), item("m", "3")];

        let diff = diff_datasets(&old, &new);
        assert_eq!(diff.added, vec!["b", "y"]);
        assert_eq!(diff.removed, vec!["z"]);
        let changed: Vec<&str> = diff.changed.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(changed, vec!["m", "q"]);
    }

    #[test]
    fn test_identical_sets() {
        let items = vec![item("a", "1")];
        assert!(diff_datasets(&items, &items).is_empty());
    }
}
