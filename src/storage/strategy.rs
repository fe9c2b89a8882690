use serde::{Serialize, Deserialize};

/// Traversal order for the request queue.
///
/// The strategy only maps an insertion index to a score; the queue owns the
/// monotonic counter and always dequeues the lowest score first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    /// Oldest insertion first
    #[default]
    Bfs,
    /// Newest insertion first
    Dfs,
}

impl QueueStrategy {
    pub fn score(self, insertion_index: u64) -> i64 {
        let index = insertion_index as i64;
        match self {
            Self::Bfs => index,
            Self::Dfs => -index,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "bfs" | "breadth" | "breadth-first" => Some(Self::Bfs),
            "dfs" | "depth" | "depth-first" => Some(Self::Dfs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores() {
        assert!(QueueStrategy::Bfs.score(0) < QueueStrategy::Bfs.score(1));
        assert!(QueueStrategy::Dfs.score(2) < QueueStrategy::Dfs.score(1));
        assert_eq!(QueueStrategy::Dfs.score(3), -3);
    }

    #[test]
    fn test_parse() {
        assert_eq!(QueueStrategy::parse("DFS"), Some(QueueStrategy::Dfs));
        assert_eq!(QueueStrategy::parse("bfs"), Some(QueueStrategy::Bfs));
        assert_eq!(QueueStrategy::parse("random"), None);
    }
}
