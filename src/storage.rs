//! Blob persistence used by the file-backed item store and the config loader.

use std::path::{Path, PathBuf};

pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
}

/// Stores blobs as files inside a single directory.
///
/// Writes go to a uniquely named sibling first and are renamed into place,
/// so readers never observe a half-written file.
#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }

    fn path_of(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path_of(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path_of(ident))
    }

    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.path_of(ident);
        let temp_path = self
            .base_dir
            .join(format!(".{}-{ident}", rusty_ulid::generate_ulid_string()));

        std::fs::write(&temp_path, data)?;

        std::fs::rename(&temp_path, &path)
    }
}
