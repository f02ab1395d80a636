//! Filesystem-backed blob store.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tracing::trace;

use crate::{BlobStore, BlobStoreError, Result, TEMP_BLOB_PREFIX, validate_name};

/// Blob store rooted at a local directory.
///
/// Blob names map to relative paths. Writes go to a temporary file in the
/// target directory and are then renamed into place, so readers never observe
/// a partial blob. Create-if-absent writes use a no-clobber rename.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| BlobStoreError::io(root.display().to_string(), e))?;
        let root = fs::canonicalize(&root)
            .map_err(|e| BlobStoreError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn write_once(&self, path: &Path, data: &[u8], if_absent: bool) -> io::Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_BLOB_PREFIX)
            .tempfile_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        if if_absent {
            tmp.persist_noclobber(path).map_err(|e| e.error)?;
        } else {
            tmp.persist(path).map_err(|e| e.error)?;
        }
        Ok(())
    }

    fn list_recursive(&self, dir: &Path, prefix: &str, names: &mut Vec<String>) -> io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if file_type.is_dir() {
                // Only descend into directories that can contain matches.
                let dir_name = format!("{name}/");
                if dir_name.starts_with(prefix) || prefix.starts_with(&dir_name) {
                    self.list_recursive(&path, prefix, names)?;
                }
            } else if file_type.is_file() && name.starts_with(prefix) {
                names.push(name);
            }
        }
        Ok(())
    }

    /// Removes empty directories between `path` and the root.
    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, name: &str, data: Bytes, if_absent: bool) -> Result<()> {
        let path = self.resolve(name)?;
        let map_err = |e: io::Error| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                BlobStoreError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                BlobStoreError::io(name, e)
            }
        };
        // A concurrent delete may prune the parent directory between
        // creating it and writing into it, so retry once after recreating.
        match self.write_once(&path, &data, if_absent) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| BlobStoreError::io(name, e))?;
                }
                self.write_once(&path, &data, if_absent).map_err(map_err)?;
            }
            other => other.map_err(map_err)?,
        }
        trace!(blob = name, bytes = data.len(), if_absent, "wrote blob");
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Bytes> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobStoreError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(BlobStoreError::io(name, e)),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                self.prune_empty_parents(&path);
                trace!(blob = name, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobStoreError::io(name, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.list_recursive(&self.root, prefix, &mut names)
            .map_err(|e| BlobStoreError::io(prefix, e))?;
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobStoreError::io(name, e)),
        }
    }

    fn size(&self, name: &str) -> Result<u64> {
        let path = self.resolve(name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobStoreError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(BlobStoreError::io(name, e)),
        }
    }
}
