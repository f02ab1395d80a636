//! In-memory blob store for tests.

use std::{collections::BTreeMap, sync::Mutex};

use bytes::Bytes;

use crate::{BlobStore, BlobStoreError, Result, validate_name};

/// Blob store backed by a sorted in-memory map.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("blob map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, name: &str, data: Bytes, if_absent: bool) -> Result<()> {
        validate_name(name)?;
        let mut blobs = self.blobs.lock().expect("blob map lock poisoned");
        if if_absent && blobs.contains_key(name) {
            return Err(BlobStoreError::AlreadyExists {
                name: name.to_string(),
            });
        }
        blobs.insert(name.to_string(), data);
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Bytes> {
        validate_name(name)?;
        self.blobs
            .lock()
            .expect("blob map lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound {
                name: name.to_string(),
            })
    }

    fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.blobs
            .lock()
            .expect("blob map lock poisoned")
            .remove(name);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.lock().expect("blob map lock poisoned");
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self
            .blobs
            .lock()
            .expect("blob map lock poisoned")
            .contains_key(name))
    }
}
