//! Local POSIX storage driver.

use crate::storage::{Storage, StorageInfo, StorageType};
use pgvault_common::{Error, Result};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filesystem storage rooted at a base directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base: PathBuf,
}

impl LocalStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        LocalStorage { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }

    fn map_missing(err: std::io::Error, path: &str) -> Error {
        if err.kind() == ErrorKind::NotFound {
            Error::FileMissing(path.to_string())
        } else {
            Error::Io(err)
        }
    }

    fn info_from_meta(name: String, meta: &fs::Metadata) -> StorageInfo {
        let storage_type = if meta.file_type().is_symlink() {
            StorageType::Link
        } else if meta.is_dir() {
            StorageType::Path
        } else if meta.is_file() {
            StorageType::File
        } else {
            StorageType::Special
        };

        StorageInfo {
            name,
            storage_type,
            size: if storage_type == StorageType::File { meta.len() } else { 0 },
            timestamp: meta.mtime(),
        }
    }

    fn list_into(
        &self,
        dir: &Path,
        prefix: &str,
        recurse: bool,
        out: &mut Vec<StorageInfo>,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let meta = fs::symlink_metadata(entry.path())?;
            let name = if prefix.is_empty() {
                entry.file_name().to_string_lossy().into_owned()
            } else {
                format!("{prefix}/{}", entry.file_name().to_string_lossy())
            };

            let info = Self::info_from_meta(name.clone(), &meta);
            let is_dir = info.storage_type == StorageType::Path;
            out.push(info);

            if recurse && is_dir {
                self.list_into(&entry.path(), &name, recurse, out)?;
            }
        }

        Ok(())
    }
}

impl Storage for LocalStorage {
    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(self.absolute(path)).map_err(|e| Self::map_missing(e, path))?;
        Ok(Box::new(file))
    }

    fn write(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        let absolute = self.absolute(path);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(fs::File::create(absolute)?))
    }

    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<()> {
        let absolute = self.absolute(path);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut temp = absolute.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, data)?;
        fs::rename(&temp, &absolute)?;
        debug!(path = path, bytes = data.len(), "atomic write");
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::symlink_metadata(self.absolute(path)).is_ok())
    }

    fn info(&self, path: &str) -> Result<StorageInfo> {
        let meta = fs::symlink_metadata(self.absolute(path))
            .map_err(|e| Self::map_missing(e, path))?;

        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());

        Ok(Self::info_from_meta(name, &meta))
    }

    fn list(&self, path: &str) -> Result<Vec<StorageInfo>> {
        let mut out = Vec::new();
        self.list_into(&self.absolute(path), "", false, &mut out)?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn list_recurse(&self, path: &str) -> Result<Vec<StorageInfo>> {
        let mut out = Vec::new();
        self.list_into(&self.absolute(path), "", true, &mut out)?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.absolute(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn remove_recurse(&self, path: &str) -> Result<()> {
        match fs::remove_dir_all(self.absolute(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn create_path(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.absolute(path))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let to_absolute = self.absolute(to);
        if let Some(parent) = to_absolute.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.absolute(from), to_absolute)
            .map_err(|e| Self::map_missing(e, from))
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let absolute = self.absolute(link);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)?;
        }

        // Replace atomically: build beside, rename over.
        let mut temp = absolute.clone().into_os_string();
        temp.push(".new");
        let temp = PathBuf::from(temp);
        let _ = fs::remove_file(&temp);
        std::os::unix::fs::symlink(target, &temp)?;
        fs::rename(&temp, &absolute)?;
        Ok(())
    }

    fn read_link(&self, path: &str) -> Result<Option<String>> {
        match fs::read_link(self.absolute(path)) {
            Ok(dest) => Ok(Some(dest.to_string_lossy().into_owned())),
            Err(err) if err.kind() == ErrorKind::InvalidInput => Ok(None),
            Err(err) => Err(Self::map_missing(err, path)),
        }
    }
}
