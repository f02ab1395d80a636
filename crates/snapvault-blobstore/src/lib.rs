//! # snapvault-blobstore: Blob storage for snapvault repositories
//!
//! A repository stores every piece of metadata and data as a named blob in a
//! flat, `/`-separated namespace. The [`BlobStore`] trait is the only storage
//! contract the repository layer relies on:
//!
//! - `put(name, bytes, if_absent)`: whole-blob writes; with `if_absent` the
//!   write fails with [`BlobStoreError::AlreadyExists`] when the name is taken,
//!   which is the compare-and-swap primitive for generation commits
//! - `get(name)`: whole-blob reads
//! - `delete(name)`: idempotent removal
//! - `list(prefix)`: every blob whose full name starts with `prefix`
//!
//! Two implementations are provided:
//!
//! - **[`FsBlobStore`]**: a directory tree, with atomic temp-file + rename writes
//! - **[`MemoryBlobStore`]**: an in-memory map for unit tests

use std::fmt::Debug;

use bytes::Bytes;

mod error;
mod fs;
mod memory;

pub use error::{BlobStoreError, Result};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Prefix of in-flight temporary files written by [`FsBlobStore`].
pub const TEMP_BLOB_PREFIX: &str = ".tmp-";

/// Returns true if the last path segment of `name` is a temporary file.
pub fn is_temp_blob(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .is_some_and(|file| file.starts_with(TEMP_BLOB_PREFIX))
}

/// Storage for named, immutable-once-written blobs.
///
/// Implementations must be safe to share between nodes and threads, and a
/// `put` with `if_absent` must be atomic: of two concurrent creates of the
/// same name, exactly one succeeds.
pub trait BlobStore: Send + Sync + Debug {
    /// Writes a blob.
    fn put(&self, name: &str, data: Bytes, if_absent: bool) -> Result<()>;

    /// Reads a blob.
    fn get(&self, name: &str) -> Result<Bytes>;

    /// Deletes a blob. Deleting a missing blob succeeds.
    fn delete(&self, name: &str) -> Result<()>;

    /// Lists blob names starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Returns true if the blob exists.
    fn exists(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Ok(_) => Ok(true),
            Err(BlobStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the size of a blob in bytes.
    fn size(&self, name: &str) -> Result<u64> {
        self.get(name).map(|data| data.len() as u64)
    }
}

/// Rejects names that could escape the store root.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(BlobStoreError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("empty");
    }
    if name.starts_with('/') {
        return invalid("absolute path");
    }
    if name.contains('\\') {
        return invalid("contains backslash");
    }
    if name.ends_with('/') {
        return invalid("trailing separator");
    }
    if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return invalid("empty or relative path segment");
    }
    Ok(())
}

#[cfg(test)]
mod tests;
