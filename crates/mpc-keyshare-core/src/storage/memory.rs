//! In-memory secure storage for testing and local development

use super::{Protection, SecureStorage};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Record {
    data: Vec<u8>,
    protection: Protection,
}

/// In-memory vault
///
/// Clones share the same underlying records, so a test can keep a handle to
/// inspect or tamper with what a store wrote.
#[derive(Debug, Clone, Default)]
pub struct MemorySecureStorage {
    records: Arc<RwLock<HashMap<String, Record>>>,
}

impl MemorySecureStorage {
    /// Create a new empty vault
    pub fn new() -> Self {
        Self::default()
    }

    /// Protection a record was written with
    pub fn protection(&self, account: &str) -> Option<Protection> {
        self.records.read().get(account).map(|r| r.protection)
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// All account names, sorted
    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.records.read().keys().cloned().collect();
        accounts.sort();
        accounts
    }
}

#[async_trait]
impl SecureStorage for MemorySecureStorage {
    async fn read(&self, account: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(account).map(|r| r.data.clone()))
    }

    async fn write(&self, account: &str, data: &[u8], protection: Protection) -> Result<()> {
        self.records.write().insert(
            account.to_string(),
            Record {
                data: data.to_vec(),
                protection,
            },
        );
        Ok(())
    }

    async fn remove(&self, account: &str) -> Result<()> {
        self.records.write().remove(account);
        Ok(())
    }

    async fn contains(&self, account: &str) -> Result<bool> {
        Ok(self.records.read().contains_key(account))
    }
}
