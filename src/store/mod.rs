//! Credential persistence
//!
//! Everything the flow must keep across process restarts goes through the
//! [`CredentialStore`] trait: issued tokens, the client registration, and,
//! while a redirect is outstanding, the PKCE verifier and the pending-flow
//! marker. Values are JSON strings keyed by server id and
//! [`CredentialKind`].
//!
//! Backends:
//!
//! - [`keyring::KeyringStore`] -- OS keychain (default).
//! - [`file::FileStore`] -- one JSON document on disk.
//! - [`memory::MemoryStore`] -- process memory, for tests and one-shot runs.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{AuthflowError, Result};

pub mod file;
pub mod keyring;
pub mod memory;

/// What a stored value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// [`TokenSet`](crate::auth::token::TokenSet).
    Tokens,
    /// [`ClientRegistration`](crate::auth::registration::ClientRegistration).
    ClientRegistration,
    /// The PKCE verifier of the outstanding redirect.
    PkceVerifier,
    /// Everything needed to resume a parked flow.
    PendingFlowMarker,
}

impl CredentialKind {
    /// All kinds.
    pub const ALL: [CredentialKind; 4] = [
        Self::Tokens,
        Self::ClientRegistration,
        Self::PkceVerifier,
        Self::PendingFlowMarker,
    ];

    /// Storage key for the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::ClientRegistration => "client_registration",
            Self::PkceVerifier => "pkce_verifier",
            Self::PendingFlowMarker => "pending_flow_marker",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialKind {
    type Err = AuthflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| AuthflowError::Storage(format!("unknown credential kind '{s}'")))
    }
}

/// Key-value persistence for credentials.
///
/// `remove` of a missing entry succeeds.
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the backend fails; a missing entry is
    /// `Ok(None)`.
    fn get(&self, server_id: &str, kind: CredentialKind) -> Result<Option<String>>;

    /// Writes a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the backend rejects the write.
    fn set(&self, server_id: &str, kind: CredentialKind, value: &str) -> Result<()>;

    /// Deletes a value.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the backend fails.
    fn remove(&self, server_id: &str, kind: CredentialKind) -> Result<()>;
}

/// Reads and deserializes a JSON value.
///
/// # Errors
///
/// Propagates backend errors and reports malformed JSON as
/// [`AuthflowError::Serialization`].
pub fn load_json<T: DeserializeOwned>(
    store: &dyn CredentialStore,
    server_id: &str,
    kind: CredentialKind,
) -> Result<Option<T>> {
    match store.get(server_id, kind)? {
        Some(raw) => Ok(Some(
            serde_json::from_str(&raw).map_err(AuthflowError::Serialization)?,
        )),
        None => Ok(None),
    }
}

/// Serializes and writes a JSON value.
///
/// # Errors
///
/// Propagates backend and serialization errors.
pub fn save_json<T: Serialize>(
    store: &dyn CredentialStore,
    server_id: &str,
    kind: CredentialKind,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value).map_err(AuthflowError::Serialization)?;
    store.set(server_id, kind, &raw)
}

/// Builds the configured backend.
///
/// # Errors
///
/// Returns [`AuthflowError::Storage`] when the file backend has no usable
/// location.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match config.backend {
        StoreBackend::Keyring => Arc::new(keyring::KeyringStore::new()),
        StoreBackend::File => match &config.path {
            Some(path) => Arc::new(file::FileStore::new(path)),
            None => Arc::new(file::FileStore::in_data_dir()?),
        },
        StoreBackend::Memory => Arc::new(memory::MemoryStore::new()),
    };
    tracing::debug!(backend = ?config.backend, "credential store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn test_json_helpers_round_trip_through_store() {
        let store = MemoryStore::new();
        save_json(&store, "srv", CredentialKind::Tokens, &Sample { value: 7 }).unwrap();
        let loaded: Option<Sample> = load_json(&store, "srv", CredentialKind::Tokens).unwrap();
        assert_eq!(loaded, Some(Sample { value: 7 }));

        let missing: Option<Sample> =
            load_json(&store, "srv", CredentialKind::ClientRegistration).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_load_json_reports_malformed_values() {
        let store = MemoryStore::new();
        store.set("srv", CredentialKind::Tokens, "{not json").unwrap();
        let result: Result<Option<Sample>> = load_json(&store, "srv", CredentialKind::Tokens);
        assert!(result.is_err());
    }

    #[test]
    fn test_credential_kind_parse() {
        assert_eq!(
            "pending_flow_marker".parse::<CredentialKind>().unwrap(),
            CredentialKind::PendingFlowMarker
        );
        assert!("password".parse::<CredentialKind>().is_err());
    }

    #[test]
    fn test_from_config_memory_backend() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            path: None,
        };
        let store = from_config(&config).unwrap();
        store.set("srv", CredentialKind::Tokens, "x").unwrap();
        assert_eq!(
            store.get("srv", CredentialKind::Tokens).unwrap().as_deref(),
            Some("x")
        );
    }
}
