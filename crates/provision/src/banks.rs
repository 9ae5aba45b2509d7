//! Dual-bank (A/B) storage with a one-byte active pointer.
//!
//! A commit writes and syncs the inactive bank, then flips the pointer. The
//! pointer write is the only commit point: until it lands, readers keep
//! seeing the previous bank.

use crate::storage::{Storage, StorageId, StorageResult};
use std::sync::Arc;
use tracing::{debug, info};

/// Bank identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    A,
    B,
}

impl Bank {
    pub fn other(&self) -> Self {
        match self {
            Bank::A => Bank::B,
            Bank::B => Bank::A,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Bank::A => "a",
            Bank::B => "b",
        }
    }

    fn from_byte(v: u8) -> Option<Self> {
        match v {
            0 => Some(Bank::A),
            1 => Some(Bank::B),
            _ => None,
        }
    }

    fn as_byte(&self) -> u8 {
        match self {
            Bank::A => 0,
            Bank::B => 1,
        }
    }
}

/// A/B banked element stored under `base/a`, `base/b` and `base/active`.
#[derive(Clone)]
pub struct BankedStore {
    storage: Arc<dyn Storage>,
    base: StorageId,
}

impl std::fmt::Debug for BankedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BankedStore").field("base", &self.base).finish()
    }
}

impl BankedStore {
    pub fn new(storage: Arc<dyn Storage>, base: StorageId) -> Self {
        Self { storage, base }
    }

    fn bank_id(&self, bank: Bank) -> StorageId {
        self.base.child(bank.name())
    }

    fn pointer_id(&self) -> StorageId {
        self.base.child("active")
    }

    /// Bank the pointer selects, `None` before the first commit
    pub fn active(&self) -> StorageResult<Option<Bank>> {
        Ok(self
            .storage
            .read_all(&self.pointer_id())?
            .and_then(|p| p.first().copied())
            .and_then(Bank::from_byte))
    }

    pub fn read(&self, bank: Bank) -> StorageResult<Option<Vec<u8>>> {
        self.storage.read_all(&self.bank_id(bank))
    }

    /// Contents of the active bank
    pub fn read_active(&self) -> StorageResult<Option<Vec<u8>>> {
        match self.active()? {
            Some(bank) => self.read(bank),
            None => Ok(None),
        }
    }

    /// Write `data` to the inactive bank and make it active.
    pub fn commit(&self, data: &[u8]) -> StorageResult<Bank> {
        let target = self.active()?.map(|b| b.other()).unwrap_or(Bank::A);
        debug!(base = %self.base, bank = ?target, len = data.len(), "writing inactive bank");
        self.storage.replace(&self.bank_id(target), data)?;
        self.set_active(target)?;
        info!(base = %self.base, bank = ?target, "bank committed");
        Ok(target)
    }

    /// Point at `bank` without touching its contents
    pub fn set_active(&self, bank: Bank) -> StorageResult<()> {
        // Single-byte overwrite in place, never remove-then-write
        let pointer = self.pointer_id();
        self.storage.write(&pointer, 0, &[bank.as_byte()])?;
        self.storage.sync(&pointer)
    }

    /// Remove both banks and the pointer
    pub fn clear(&self) -> StorageResult<()> {
        self.storage.remove(&self.pointer_id())?;
        self.storage.remove(&self.bank_id(Bank::A))?;
        self.storage.remove(&self.bank_id(Bank::B))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn store() -> (Arc<MemoryStorage>, BankedStore) {
        let storage = Arc::new(MemoryStorage::new());
        let banks = BankedStore::new(storage.clone(), StorageId::new("tl/static"));
        (storage, banks)
    }

    #[test]
    fn test_commits_alternate_banks() {
        let (_, banks) = store();
        assert_eq!(banks.active().unwrap(), None);
        assert_eq!(banks.commit(b"one").unwrap(), Bank::A);
        assert_eq!(banks.commit(b"two").unwrap(), Bank::B);
        assert_eq!(banks.read_active().unwrap().unwrap(), b"two");
        assert_eq!(banks.read(Bank::A).unwrap().unwrap(), b"one");
        assert_eq!(banks.commit(b"three").unwrap(), Bank::A);
        assert_eq!(banks.read(Bank::B).unwrap().unwrap(), b"two");
    }

    #[test]
    fn test_failed_commit_keeps_previous() {
        let (storage, banks) = store();
        banks.commit(b"good").unwrap();
        storage.fail_writes(Some("tl/static/b"));
        assert!(banks.commit(b"new").is_err());
        assert_eq!(banks.active().unwrap(), Some(Bank::A));
        assert_eq!(banks.read_active().unwrap().unwrap(), b"good");
    }

    #[test]
    fn test_failed_pointer_write_keeps_previous() {
        let (storage, banks) = store();
        banks.commit(b"good").unwrap();
        storage.fail_writes(Some("tl/static/active"));
        assert!(banks.commit(b"new").is_err());
        storage.fail_writes(None);
        assert_eq!(banks.read_active().unwrap().unwrap(), b"good");
    }

    #[test]
    fn test_clear() {
        let (storage, banks) = store();
        banks.commit(b"x").unwrap();
        banks.clear().unwrap();
        assert!(storage.ids().is_empty());
        assert_eq!(banks.read_active().unwrap(), None);
    }
}
