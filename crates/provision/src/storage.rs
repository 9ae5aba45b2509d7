//! Byte-blob storage boundary.
//!
//! Trust lists and firmware images are persisted through [`Storage`], an
//! id-addressed blob store supplied by the platform (flash file system, host
//! directory). [`MemoryStorage`] backs gateways without persistence and
//! every test in the workspace.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Read past the end of an element
    #[error("Read out of range for {id}: offset {offset} len {len}, size {size}")]
    OutOfRange {
        id: StorageId,
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Write would leave a hole in the element
    #[error("Non-contiguous write to {id}: offset {offset}, size {size}")]
    Gap {
        id: StorageId,
        offset: usize,
        size: usize,
    },

    /// Backing device failure
    #[error("Storage device error on {id}: {reason}")]
    Device { id: StorageId, reason: String },

    /// Lock poisoned by a panicking thread
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Identifier of a stored element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(String);

impl StorageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a child id, `parent/name`
    pub fn child(&self, name: &str) -> StorageId {
        StorageId(format!("{}/{}", self.0, name))
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id-addressed blob storage.
pub trait Storage: Send + Sync {
    /// Size of an element, `None` when absent
    fn size(&self, id: &StorageId) -> StorageResult<Option<usize>>;

    /// Read `len` bytes at `offset`
    fn read(&self, id: &StorageId, offset: usize, len: usize) -> StorageResult<Vec<u8>>;

    /// Write `data` at `offset`, creating or extending the element.
    /// Writing past the current end is rejected.
    fn write(&self, id: &StorageId, offset: usize, data: &[u8]) -> StorageResult<()>;

    /// Flush pending writes of an element to the medium
    fn sync(&self, id: &StorageId) -> StorageResult<()>;

    /// Delete an element; deleting an absent element succeeds
    fn remove(&self, id: &StorageId) -> StorageResult<()>;

    /// Read a whole element, `None` when absent
    fn read_all(&self, id: &StorageId) -> StorageResult<Option<Vec<u8>>> {
        match self.size(id)? {
            Some(size) => self.read(id, 0, size).map(Some),
            None => Ok(None),
        }
    }

    /// Replace an element with `data`
    fn replace(&self, id: &StorageId, data: &[u8]) -> StorageResult<()> {
        self.remove(id)?;
        self.write(id, 0, data)?;
        self.sync(id)
    }
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn size(&self, id: &StorageId) -> StorageResult<Option<usize>> {
        (**self).size(id)
    }

    fn read(&self, id: &StorageId, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read(id, offset, len)
    }

    fn write(&self, id: &StorageId, offset: usize, data: &[u8]) -> StorageResult<()> {
        (**self).write(id, offset, data)
    }

    fn sync(&self, id: &StorageId) -> StorageResult<()> {
        (**self).sync(id)
    }

    fn remove(&self, id: &StorageId) -> StorageResult<()> {
        (**self).remove(id)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    elements: HashMap<StorageId, Vec<u8>>,
    failing_prefix: Option<String>,
}

/// In-memory storage.
///
/// Supports write fault injection so callers can exercise their
/// no-partial-commit paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to ids starting with `prefix` fail; `None` clears it
    pub fn fail_writes(&self, prefix: Option<&str>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_prefix = prefix.map(str::to_string);
        }
    }

    /// Ids currently stored, sorted
    pub fn ids(&self) -> Vec<StorageId> {
        let mut ids: Vec<StorageId> = self
            .state
            .lock()
            .map(|s| s.elements.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl Storage for MemoryStorage {
    fn size(&self, id: &StorageId) -> StorageResult<Option<usize>> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(state.elements.get(id).map(Vec::len))
    }

    fn read(&self, id: &StorageId, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        let data = state.elements.get(id).map(Vec::as_slice).unwrap_or(&[]);
        let end = offset.checked_add(len).filter(|end| *end <= data.len());
        match end {
            Some(end) => Ok(data[offset..end].to_vec()),
            None => Err(StorageError::OutOfRange {
                id: id.clone(),
                offset,
                len,
                size: data.len(),
            }),
        }
    }

    fn write(&self, id: &StorageId, offset: usize, data: &[u8]) -> StorageResult<()> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        if let Some(prefix) = &state.failing_prefix {
            if id.as_str().starts_with(prefix.as_str()) {
                return Err(StorageError::Device {
                    id: id.clone(),
                    reason: "injected write failure".to_string(),
                });
            }
        }
        let element = state.elements.entry(id.clone()).or_default();
        if offset > element.len() {
            return Err(StorageError::Gap {
                id: id.clone(),
                offset,
                size: element.len(),
            });
        }
        let end = offset + data.len();
        if end > element.len() {
            element.resize(end, 0);
        }
        element[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self, _id: &StorageId) -> StorageResult<()> {
        Ok(())
    }

    fn remove(&self, id: &StorageId) -> StorageResult<()> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        state.elements.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_extend() {
        let storage = MemoryStorage::new();
        let id = StorageId::new("tl/tmp");
        storage.write(&id, 0, b"head").unwrap();
        storage.write(&id, 4, b"body").unwrap();
        storage.write(&id, 2, b"AD").unwrap();
        assert_eq!(storage.read_all(&id).unwrap().unwrap(), b"heADbody");
        assert_eq!(storage.size(&id).unwrap(), Some(8));
    }

    #[test]
    fn test_gap_rejected() {
        let storage = MemoryStorage::new();
        let id = StorageId::new("x");
        assert!(matches!(
            storage.write(&id, 3, b"z"),
            Err(StorageError::Gap { offset: 3, .. })
        ));
    }

    #[test]
    fn test_read_out_of_range() {
        let storage = MemoryStorage::new();
        let id = StorageId::new("x");
        storage.write(&id, 0, b"abc").unwrap();
        assert!(storage.read(&id, 2, 5).is_err());
        assert_eq!(storage.read_all(&StorageId::new("missing")).unwrap(), None);
    }

    #[test]
    fn test_injected_failure() {
        let storage = MemoryStorage::new();
        storage.fail_writes(Some("tl/static"));
        assert!(storage.write(&StorageId::new("tl/static/a"), 0, b"x").is_err());
        assert!(storage.write(&StorageId::new("tl/tmp"), 0, b"x").is_ok());
        storage.fail_writes(None);
        assert!(storage.write(&StorageId::new("tl/static/a"), 0, b"x").is_ok());
    }

    #[test]
    fn test_child_ids() {
        let base = StorageId::new("fw");
        assert_eq!(base.child("active").as_str(), "fw/active");
    }
}
