use crate::api::SetupData;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Durable form of an in-flight provisioning session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub vm_name: String,
    pub setup_data: SetupData,
    /// Creation instant, unix milliseconds.
    pub timestamp: i64,
}

impl PersistedSession {
    pub fn is_expired(&self, now_unix_millis: i64, ttl: Duration) -> bool {
        now_unix_millis.saturating_sub(self.timestamp) > ttl.as_millis() as i64
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ошибка ввода-вывода {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось сериализовать сессию: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Single-record store under a fixed file path. Written once on creation,
/// removed on any terminal transition, read once at startup.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A record that cannot be parsed is removed and reported as absent.
    pub fn load(&self) -> Result<Option<PersistedSession>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };

        match serde_json::from_str(&text) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "повреждённая запись сессии удалена");
                self.clear()?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, session: &PersistedSession) -> Result<(), StoreError> {
        let data = serde_json::to_vec(session)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data).map_err(|source| self.io_error(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
