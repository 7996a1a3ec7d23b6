//! In-memory document storage.
//!
//! Primarily intended for tests and for servers that should not touch the
//! filesystem. Content is lost on restart.

use std::collections::HashMap;
use std::sync::RwLock;

use super::storage::{validate_name, DocumentStorage, StorageResult};

/// In-memory implementation of `DocumentStorage`
#[derive(Debug, Default)]
pub struct MemoryDocumentStorage {
    documents: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryDocumentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage pre-populated with one document.
    pub fn with_document(name: impl Into<String>, lines: Vec<String>) -> Self {
        let documents = HashMap::from([(name.into(), lines)]);
        Self {
            documents: RwLock::new(documents),
        }
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStorage for MemoryDocumentStorage {
    fn load(&self, name: &str) -> StorageResult<Option<Vec<String>>> {
        validate_name(name)?;
        let docs = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(name).cloned())
    }

    fn save(&self, name: &str, lines: &[String]) -> StorageResult<()> {
        validate_name(name)?;
        let mut docs = self.documents.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(name.to_string(), lines.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_round_trip() {
        let storage = MemoryDocumentStorage::new();
        assert!(storage.is_empty());
        assert_eq!(storage.load("a").unwrap(), None);

        storage.save("a", &["x".to_string()]).unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.load("a").unwrap(), Some(vec!["x".to_string()]));
    }

    #[test]
    fn test_with_document() {
        let storage = MemoryDocumentStorage::with_document("doc", vec!["hi".to_string()]);
        assert_eq!(storage.load("doc").unwrap(), Some(vec!["hi".to_string()]));
    }
}
