//! OS keychain backend
//!
//! Each server gets its own keyring service, `authflow-<server_id>`, and each
//! [`CredentialKind`] is stored under the account name of the kind. Keychain
//! on macOS, Secret Service on Linux, Credential Manager on Windows.

use crate::error::{AuthflowError, Result};
use crate::store::{CredentialKind, CredentialStore};

const SERVICE_PREFIX: &str = "authflow-";

/// Stateless accessor for the OS native keyring.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl KeyringStore {
    /// Creates the accessor.
    pub fn new() -> Self {
        Self
    }

    /// Keyring service name for a server.
    pub fn service_name(server_id: &str) -> String {
        format!("{SERVICE_PREFIX}{server_id}")
    }

    fn entry(server_id: &str, kind: CredentialKind) -> Result<::keyring::Entry> {
        Ok(::keyring::Entry::new(&Self::service_name(server_id), kind.as_str())
            .map_err(AuthflowError::Keyring)?)
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, server_id: &str, kind: CredentialKind) -> Result<Option<String>> {
        match Self::entry(server_id, kind)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(::keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AuthflowError::Keyring(e).into()),
        }
    }

    fn set(&self, server_id: &str, kind: CredentialKind, value: &str) -> Result<()> {
        Self::entry(server_id, kind)?
            .set_password(value)
            .map_err(AuthflowError::Keyring)?;
        tracing::debug!(server_id, kind = %kind, "stored credential in keyring");
        Ok(())
    }

    fn remove(&self, server_id: &str, kind: CredentialKind) -> Result<()> {
        match Self::entry(server_id, kind)?.delete_password() {
            Ok(()) | Err(::keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AuthflowError::Keyring(e).into()),
        }
    }
}
