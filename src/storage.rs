// src/storage.rs
use crate::types::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

/// Position snapshot on disk as pretty JSON. Writes go through a temp file
/// and a rename so a crash never leaves half a file behind.
#[derive(Debug, Clone)]
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `Ok(None)` when nothing has been saved yet.
    pub async fn load(&self) -> io::Result<Option<StoredState>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let state: StoredState = serde_json::from_str(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        info!(
            "Loaded position {} saved at {} from {}",
            state.position,
            state.updated_at,
            self.path.display()
        );
        Ok(Some(state))
    }

    pub async fn save(&self, position: &Position) -> io::Result<()> {
        let state = StoredState {
            position: *position,
            updated_at: Utc::now(),
        };
        let data = serde_json::to_string_pretty(&state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Saved position {} to {}", position, self.path.display());
        Ok(())
    }
}
