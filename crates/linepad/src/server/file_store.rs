//! File-based document storage.
//!
//! One plain text file per document, one line per document line, under a
//! configured root:
//!
//! ```text
//! data/files/
//! ├── shared_document.txt
//! └── notes.txt
//! ```
//!
//! # Example
//!
//! ```ignore
//! use linepad::server::file_store::FileDocumentStorage;
//! use linepad::server::storage::DocumentStorage;
//!
//! let storage = FileDocumentStorage::new("./data/files")?;
//! storage.save("notes.txt", &["hello".to_string()])?;
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::storage::{validate_name, DocumentStorage, StorageResult};
use crate::document::Document;

/// Stores each document as a text file under `root`.
#[derive(Debug, Clone)]
pub struct FileDocumentStorage {
    root: PathBuf,
}

impl FileDocumentStorage {
    /// Create a file storage rooted at `root`, creating the directory if
    /// it doesn't exist.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
            tracing::info!(root = %root.display(), "Created storage directory");
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> StorageResult<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl DocumentStorage for FileDocumentStorage {
    fn load(&self, name: &str) -> StorageResult<Option<Vec<String>>> {
        let path = self.path_for(name)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(Document::from_text(&text).into_lines())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, lines: &[String]) -> StorageResult<()> {
        let path = self.path_for(name)?;

        // Write a hidden sibling first, then rename over the target.
        let tmp = self.root.join(format!(".{name}.tmp"));
        fs::write(&tmp, Document::from_lines(lines).to_text())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
