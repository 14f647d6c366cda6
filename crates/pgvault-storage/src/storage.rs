//! Core storage trait.
//!
//! All paths are relative to the driver's base. The interface is blocking:
//! callers stream whole files through it from the blocking pool, never from
//! an async task.

use pgvault_common::Result;
use std::io::{Read, Write};

/// Kind of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    File,
    Path,
    Link,
    Special,
}

/// Metadata for one stored object.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    /// Name relative to the listed path.
    pub name: String,
    pub storage_type: StorageType,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub timestamp: i64,
}

/// Core storage trait.
pub trait Storage: Send + Sync {
    /// Open a file for streaming reads. Fails `FileMissing` when absent.
    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Open a file for streaming writes, creating parent directories.
    fn write(&self, path: &str) -> Result<Box<dyn Write + Send>>;

    /// Read an entire file into memory.
    fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.read(path)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Write a file through a temp name and rename, so readers never see a
    /// torn write.
    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool>;

    /// Metadata for one object. Fails `FileMissing` when absent.
    fn info(&self, path: &str) -> Result<StorageInfo>;

    /// Non-recursive listing of a directory, sorted by name. An absent
    /// directory lists as empty.
    fn list(&self, path: &str) -> Result<Vec<StorageInfo>>;

    /// Recursive listing of every object under a directory, names relative
    /// to it, sorted.
    fn list_recurse(&self, path: &str) -> Result<Vec<StorageInfo>>;

    fn remove(&self, path: &str) -> Result<()>;

    fn remove_recurse(&self, path: &str) -> Result<()>;

    fn create_path(&self, path: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Create or replace a symlink at `link` pointing to `target`.
    fn symlink(&self, target: &str, link: &str) -> Result<()>;

    /// Destination of a symlink, or `None` when `path` is not a link.
    fn read_link(&self, path: &str) -> Result<Option<String>>;
}
