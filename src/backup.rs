//! On-disk backup of the last known flag state, and bootstrap seeding.
//!
//! Only the latest state is kept. It is stored together with the id of the
//! context it was evaluated for, and a backup is only restored for that same
//! context.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{ErrorCode, FlagSyncError, Result};
use crate::types::{Context, FlagState, ProxyResponse, Toggle};

/// File name of the state backup inside the backup directory.
pub const STATE_BACKUP_FILE: &str = "unleash_state.json";
const LOCK_FILE: &str = "unleash_state.lock";

/// Pluggable sink and source for the last known state.
pub trait BackupStore: Send + Sync {
    /// The stored state, if there is one for `context`.
    fn load(&self, context: &Context) -> Option<FlagState>;
    fn save(&self, state: &FlagState) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupState {
    context_id: String,
    toggles: HashMap<String, Toggle>,
}

/// File-based backup guarded by an exclusive lock file.
///
/// One state is kept, tagged with the id of the context it was fetched
/// for. Loading for any other context yields nothing.
#[derive(Debug, Clone)]
pub struct LocalBackup {
    dir: PathBuf,
}

impl LocalBackup {
    /// Creates `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            FlagSyncError::with_source(
                ErrorCode::BackupWriteError,
                format!("Failed to create backup directory: {}", dir.display()),
                e,
            )
        })?;
        Ok(Self { dir })
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP_FILE)
    }

    /// Like `load`, but reports why nothing was restored.
    pub fn try_load(&self, context: &Context) -> Result<Option<FlagState>> {
        let path = self.state_file();
        let _lock = self.acquire_lock()?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No backup found at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(FlagSyncError::with_source(
                    ErrorCode::BackupReadError,
                    format!("Failed to read backup: {}", path.display()),
                    e,
                ))
            }
        };

        let backup: BackupState = serde_json::from_slice(&bytes).map_err(|e| {
            FlagSyncError::with_source(
                ErrorCode::BackupReadError,
                format!("Corrupt backup: {}", path.display()),
                e,
            )
        })?;
        if backup.context_id != context.id() {
            tracing::info!("Context id mismatch, ignoring backup");
            return Ok(None);
        }
        Ok(Some(FlagState::new(context.clone(), backup.toggles)))
    }

    fn acquire_lock(&self) -> Result<File> {
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))
            .map_err(|e| {
                FlagSyncError::with_source(ErrorCode::BackupWriteError, "Failed to open lock file", e)
            })?;
        lock_file.lock_exclusive().map_err(|e| {
            FlagSyncError::with_source(
                ErrorCode::BackupWriteError,
                "Failed to acquire backup lock",
                e,
            )
        })?;
        Ok(lock_file)
    }
}

impl BackupStore for LocalBackup {
    fn load(&self, context: &Context) -> Option<FlagState> {
        match self.try_load(context) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Error loading backup: {}", e);
                None
            }
        }
    }

    fn save(&self, state: &FlagState) -> Result<()> {
        let backup = BackupState {
            context_id: state.context.id(),
            toggles: state.toggles.clone(),
        };
        let bytes = serde_json::to_vec(&backup).map_err(|e| {
            FlagSyncError::with_source(ErrorCode::BackupWriteError, "Failed to encode backup", e)
        })?;

        let path = self.state_file();
        let tmp = path.with_extension("json.tmp");
        let _lock = self.acquire_lock()?;
        fs::write(&tmp, &bytes)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                FlagSyncError::with_source(
                    ErrorCode::BackupWriteError,
                    format!("Failed to write backup: {}", path.display()),
                    e,
                )
            })?;
        tracing::debug!("Written state to {}", path.display());
        Ok(())
    }
}

/// Toggles to serve before the first fetch completes.
#[derive(Debug, Clone)]
pub enum Bootstrap {
    Toggles(Vec<Toggle>),
    /// A JSON file shaped like a server response: `{"toggles": [...]}`.
    File(PathBuf),
}

impl Bootstrap {
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        Bootstrap::File(path.as_ref().to_path_buf())
    }

    /// Reads the toggles, parsing the file for `Bootstrap::File`.
    pub fn into_toggles(self) -> Result<Vec<Toggle>> {
        match self {
            Bootstrap::Toggles(toggles) => Ok(toggles),
            Bootstrap::File(path) => {
                let bytes = fs::read(&path).map_err(|e| {
                    FlagSyncError::with_source(
                        ErrorCode::BootstrapReadError,
                        format!("Failed to read bootstrap file: {}", path.display()),
                        e,
                    )
                })?;
                let response: ProxyResponse = serde_json::from_slice(&bytes).map_err(|e| {
                    FlagSyncError::with_source(
                        ErrorCode::BootstrapReadError,
                        format!("Invalid bootstrap file: {}", path.display()),
                        e,
                    )
                })?;
                Ok(response.toggles)
            }
        }
    }
}
