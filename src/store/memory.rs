//! In-memory backend

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AuthflowError, Result};
use crate::store::{CredentialKind, CredentialStore};

/// Credentials held in process memory. Lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, CredentialKind), String>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when a value exists for the server and kind.
    pub fn contains(&self, server_id: &str, kind: CredentialKind) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(&(server_id.to_string(), kind)))
            .unwrap_or(false)
    }

    fn poisoned() -> AuthflowError {
        AuthflowError::Storage("memory store lock poisoned".to_string())
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, server_id: &str, kind: CredentialKind) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries.get(&(server_id.to_string(), kind)).cloned())
    }

    fn set(&self, server_id: &str, kind: CredentialKind, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.insert((server_id.to_string(), kind), value.to_string());
        Ok(())
    }

    fn remove(&self, server_id: &str, kind: CredentialKind) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.remove(&(server_id.to_string(), kind));
        Ok(())
    }
}
