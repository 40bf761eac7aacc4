//! JSON file backend
//!
//! All servers share one document:
//!
//! ```json
//! { "notion": { "tokens": "...", "client_registration": "..." } }
//! ```
//!
//! Writes go to a sibling temp file that is then renamed over the target,
//! so a crash never leaves a half-written document. On Unix the file is
//! created with mode `0600`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use directories::ProjectDirs;

use crate::error::{AuthflowError, Result};
use crate::store::{CredentialKind, CredentialStore};

type Document = BTreeMap<String, BTreeMap<String, String>>;

/// Credentials in a JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within the process.
    lock: Mutex<()>,
}

impl FileStore {
    /// A store at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// A store at `<data dir>/credentials.json`.
    ///
    /// The `AUTHFLOW_CREDENTIALS_FILE` environment variable overrides the
    /// location.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Storage`] when no data directory can be
    /// determined for the current user.
    pub fn in_data_dir() -> Result<Self> {
        if let Ok(path) = std::env::var("AUTHFLOW_CREDENTIALS_FILE") {
            return Ok(Self::new(path));
        }
        let dirs = ProjectDirs::from("com", "authflow", "authflow")
            .ok_or_else(|| AuthflowError::Storage("could not determine data directory".into()))?;
        Ok(Self::new(dirs.data_dir().join("credentials.json")))
    }

    /// The document location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Document> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(Document::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)
                .with_context(|| format!("malformed credentials file {}", self.path.display()))?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(AuthflowError::Io(e).into()),
        }
    }

    fn write(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context("Failed to create credentials directory")
                    .map_err(|e| AuthflowError::Storage(e.to_string()))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(doc).map_err(AuthflowError::Serialization)?;
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp).map_err(AuthflowError::Io)?;
            file.write_all(raw.as_bytes()).map_err(AuthflowError::Io)?;
            file.sync_all().map_err(AuthflowError::Io)?;
        }
        fs::rename(&tmp, &self.path).map_err(AuthflowError::Io)?;
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| AuthflowError::Storage("file store lock poisoned".to_string()).into())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, server_id: &str, kind: CredentialKind) -> Result<Option<String>> {
        let _guard = self.guard()?;
        let doc = self.read()?;
        Ok(doc.get(server_id).and_then(|m| m.get(kind.as_str())).cloned())
    }

    fn set(&self, server_id: &str, kind: CredentialKind, value: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut doc = self.read()?;
        doc.entry(server_id.to_string())
            .or_default()
            .insert(kind.as_str().to_string(), value.to_string());
        self.write(&doc)?;
        tracing::debug!(server_id, kind = %kind, path = %self.path.display(), "stored credential");
        Ok(())
    }

    fn remove(&self, server_id: &str, kind: CredentialKind) -> Result<()> {
        let _guard = self.guard()?;
        let mut doc = self.read()?;
        let Some(entries) = doc.get_mut(server_id) else {
            return Ok(());
        };
        if entries.remove(kind.as_str()).is_none() {
            return Ok(());
        }
        if entries.is_empty() {
            doc.remove(server_id);
        }
        self.write(&doc)
    }
}
