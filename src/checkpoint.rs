//! Persistence of whole actor states.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    actors::ActorState,
    error::{Result, SwarmError},
};

/// Persists actor states as opaque blobs keyed by directory and epoch.
pub trait CheckpointStore: Send + Sync {
    /// Stores `state` as the snapshot of `epoch` under `path`.
    fn save(&self, state: &ActorState, path: &Path, epoch: u64) -> Result<()>;

    /// Returns the latest snapshot under `path`, or `None` if there is none.
    ///
    /// # Errors
    /// A `CheckpointLoad` error if a snapshot exists but cannot be decoded.
    fn load(&self, path: &Path) -> Result<Option<ActorState>>;
}

/// Keeps one JSON file per epoch, `<path>/<epoch>.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileStore;

impl JsonFileStore {
    fn latest(path: &Path) -> Result<Option<(u64, PathBuf)>> {
        if !path.is_dir() {
            return Ok(None);
        }

        let mut latest = None;
        for entry in fs::read_dir(path)? {
            let file = entry?.path();
            if file.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let Some(epoch) = file
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };

            if latest.as_ref().is_none_or(|(best, _)| epoch > *best) {
                latest = Some((epoch, file));
            }
        }

        Ok(latest)
    }
}

impl CheckpointStore for JsonFileStore {
    fn save(&self, state: &ActorState, path: &Path, epoch: u64) -> Result<()> {
        fs::create_dir_all(path)?;

        let file = path.join(format!("{epoch}.json"));
        let tmp = path.join(format!("{epoch}.json.tmp"));

        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &file)?;

        debug!(path:% = file.display(); "snapshot written");
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Option<ActorState>> {
        let Some((epoch, file)) = Self::latest(path)? else {
            return Ok(None);
        };

        let corrupt = |reason: String| SwarmError::CheckpointLoad {
            path: file.clone(),
            reason,
        };

        let bytes = fs::read(&file).map_err(|e| corrupt(e.to_string()))?;
        let state: ActorState = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        state.ensure_consistent().map_err(|e| corrupt(e.to_string()))?;

        debug!(epoch, path:% = file.display(); "snapshot read");
        Ok(Some(state))
    }
}
