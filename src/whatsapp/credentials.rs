//! Durable credential store for the protocol session.
//!
//! A directory of JSON files whose names and contents belong to the protocol
//! client. The store reads every file before connecting and rewrites the
//! files named in each credential update, atomically and with private
//! permissions.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::WhatsAppError;

/// Extension of files managed by the store.
const FILE_EXTENSION: &str = "json";

/// Credential material loaded from the store.
#[derive(Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AuthState {
    files: BTreeMap<String, serde_json::Value>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("contents", &"[REDACTED]")
            .finish()
    }
}

impl AuthState {
    /// Build from a file-name-to-content map.
    pub fn from_files(files: BTreeMap<String, serde_json::Value>) -> Self {
        Self { files }
    }

    /// Content of one file, if present.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.files.get(name)
    }

    /// Whether no material is stored yet (first pairing).
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of stored files.
    pub fn len(&self) -> usize {
        self.files.len()
    }
}

/// The credential directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at `dir`. Nothing is touched until first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory backing the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every stored file. Creates the directory when missing.
    ///
    /// # Errors
    ///
    /// Returns [`WhatsAppError::CredentialStore`] on I/O failure and
    /// [`WhatsAppError::Serialization`] when a file is not valid JSON.
    pub fn load(&self) -> Result<AuthState, WhatsAppError> {
        self.ensure_dir()?;

        let mut files = BTreeMap::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.dir, e))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION)
            {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let contents = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
            files.insert(name.to_owned(), serde_json::from_str(&contents)?);
        }

        debug!(dir = %self.dir.display(), files = files.len(), "loaded credential store");
        Ok(AuthState { files })
    }

    /// Apply a credential update. Each file is written to a temporary sibling,
    /// flushed to disk, and renamed into place. A `null` value deletes the file.
    ///
    /// # Errors
    ///
    /// Returns [`WhatsAppError::CredentialStore`] on I/O failure or when a file
    /// name would escape the store directory.
    pub fn persist(
        &self,
        files: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), WhatsAppError> {
        self.ensure_dir()?;

        for (name, contents) in files {
            let path = self.file_path(name)?;
            if contents.is_null() {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(&path, e)),
                }
                continue;
            }
            let bytes = serde_json::to_vec(contents)?;
            write_atomic(&path, &bytes)?;
        }

        debug!(dir = %self.dir.display(), files = files.len(), "persisted credential update");
        Ok(())
    }

    fn file_path(&self, name: &str) -> Result<PathBuf, WhatsAppError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && Path::new(name).extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION);
        if !valid {
            return Err(io_error(
                &self.dir.join(name),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid credential file name",
                ),
            ));
        }
        Ok(self.dir.join(name))
    }

    fn ensure_dir(&self) -> Result<(), WhatsAppError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_error(&self.dir, e))?;
        }

        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WhatsAppError> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        enforce_private_file_permissions(&tmp)?;
        file.write_all(bytes).map_err(|e| io_error(&tmp, e))?;
        file.sync_all().map_err(|e| io_error(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;
    Ok(())
}

/// Restrict a file to its owner when supported.
fn enforce_private_file_permissions(path: &Path) -> Result<(), WhatsAppError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| io_error(path, e))?;
    }

    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> WhatsAppError {
    WhatsAppError::CredentialStore {
        path: path.display().to_string(),
        source,
    }
}
