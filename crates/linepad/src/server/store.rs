//! The shared document store.
//!
//! Owns every open document, keyed by name. Each document sits behind its
//! own lock, held only for a single validate-and-apply step, so edits to
//! one document never wait on another and no lock survives past the
//! mutation it guards.
//!
//! Documents come into memory on first access (from storage, or empty if
//! nothing is stored) and go back to storage only when `save` is called.

use crate::document::{Document, Operation};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::memory_store::MemoryDocumentStorage;
use super::storage::{DocumentStorage, StorageResult};

/// Name-keyed collection of live documents.
pub struct DocumentStore {
    storage: Arc<dyn DocumentStorage>,
    documents: RwLock<HashMap<String, Arc<Mutex<Document>>>>,
}

impl DocumentStore {
    /// Create a store backed by `storage`.
    pub fn new(storage: Arc<dyn DocumentStorage>) -> Self {
        Self {
            storage,
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDocumentStorage::new()))
    }

    /// Get a loaded document, loading it on first access.
    async fn document(&self, name: &str) -> StorageResult<Arc<Mutex<Document>>> {
        if let Some(doc) = self.documents.read().await.get(name) {
            return Ok(Arc::clone(doc));
        }

        let mut docs = self.documents.write().await;
        // Another task may have loaded it while we waited for the write lock.
        if let Some(doc) = docs.get(name) {
            return Ok(Arc::clone(doc));
        }

        let doc = Arc::new(Mutex::new(self.read_from_storage(name)?));
        docs.insert(name.to_string(), Arc::clone(&doc));
        Ok(doc)
    }

    fn read_from_storage(&self, name: &str) -> StorageResult<Document> {
        match self.storage.load(name)? {
            Some(lines) => {
                tracing::info!(document = name, lines = lines.len(), "Loaded document");
                Ok(Document::from_lines(lines))
            }
            None => {
                tracing::info!(document = name, "No stored document, starting empty");
                Ok(Document::new())
            }
        }
    }

    /// Validate and apply `op` to the named document.
    ///
    /// Returns `false`, leaving the document untouched, when the operation
    /// is out of range or the document cannot be loaded.
    pub async fn apply_operation(&self, name: &str, op: &Operation) -> bool {
        let doc = match self.document(name).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(document = name, error = %e, "Cannot load document");
                return false;
            }
        };

        let mut doc = doc.lock().await;
        match doc.apply(op) {
            Ok(()) => true,
            Err(rejection) => {
                tracing::debug!(document = name, ?op, %rejection, "Operation rejected");
                false
            }
        }
    }

    /// A full copy of the document's current lines.
    pub async fn get_snapshot(&self, name: &str) -> StorageResult<Vec<String>> {
        let doc = self.document(name).await?;
        let lines = doc.lock().await.lines().to_vec();
        Ok(lines)
    }

    /// (Re)load a document from storage, replacing any in-memory copy.
    pub async fn load(&self, name: &str) -> StorageResult<()> {
        let loaded = self.read_from_storage(name)?;
        let mut docs = self.documents.write().await;
        match docs.get(name) {
            Some(doc) => *doc.lock().await = loaded,
            None => {
                docs.insert(name.to_string(), Arc::new(Mutex::new(loaded)));
            }
        }
        Ok(())
    }

    /// Write a loaded document to storage.
    ///
    /// Returns `Ok(false)` if the document was never loaded.
    pub async fn save(&self, name: &str) -> StorageResult<bool> {
        let doc = match self.documents.read().await.get(name) {
            Some(doc) => Arc::clone(doc),
            None => return Ok(false),
        };
        let lines = doc.lock().await.lines().to_vec();
        self.storage.save(name, &lines)?;
        tracing::info!(document = name, lines = lines.len(), "Saved document");
        Ok(true)
    }

    /// Save every loaded document. Returns how many were written.
    pub async fn save_all(&self) -> StorageResult<usize> {
        let names: Vec<String> = self.documents.read().await.keys().cloned().collect();
        let mut saved = 0;
        for name in names {
            if self.save(&name).await? {
                saved += 1;
            }
        }
        Ok(saved)
    }

    /// Number of documents currently held in memory.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}
