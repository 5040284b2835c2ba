use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{PollError, Result};

/// Identifies one counter's persisted state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub device_id: u32,
    pub component_id: u32,
    pub prefix: String,
}

impl CounterKey {
    pub fn new(device_id: u32, component_id: u32, prefix: impl Into<String>) -> Self {
        Self {
            device_id,
            component_id,
            prefix: prefix.into(),
        }
    }

    fn file_name(&self) -> String {
        format!(
            "counter_{}_{}_{}.json",
            self.device_id, self.component_id, self.prefix
        )
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device {}/component {}/{}",
            self.device_id, self.component_id, self.prefix
        )
    }
}

/// Energy totals plus the sample they were last advanced with
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeCounterState {
    /// Wh
    pub imported: f64,
    /// Wh
    pub exported: f64,
    /// Unix seconds of the last accepted sample
    pub timestamp: f64,
    /// W
    pub power: f64,
}

/// Durable storage for counter state
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load(&self, key: &CounterKey) -> Result<Option<CumulativeCounterState>>;

    /// Must not return before the state is durable
    async fn save(&self, key: &CounterKey, state: &CumulativeCounterState) -> Result<()>;
}

/// Stores each counter as a JSON file inside one directory
pub struct JsonFileStore {
    directory: PathBuf,
}

impl JsonFileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, key: &CounterKey) -> PathBuf {
        self.directory.join(key.file_name())
    }
}

#[async_trait]
impl CounterStore for JsonFileStore {
    async fn load(&self, key: &CounterKey) -> Result<Option<CumulativeCounterState>> {
        let path = self.path_for(key);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PollError::Persistence(format!(
                    "reading {}: {e}",
                    path.display()
                )))
            }
        };
        let state = serde_json::from_slice(&contents)?;
        Ok(Some(state))
    }

    async fn save(&self, key: &CounterKey, state: &CumulativeCounterState) -> Result<()> {
        let persistence = |e: std::io::Error| PollError::Persistence(e.to_string());
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(persistence)?;

        // Write next to the target, fsync, then rename over it
        let path = self.path_for(key);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_vec(state)?;
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(persistence)?;
        file.write_all(&body).await.map_err(persistence)?;
        file.sync_all().await.map_err(persistence)?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(persistence)?;

        // The rename is only durable once the directory entry is synced
        tokio::fs::File::open(&self.directory)
            .await
            .map_err(persistence)?
            .sync_all()
            .await
            .map_err(persistence)?;
        Ok(())
    }
}

/// Volatile store, state is lost with the process
#[derive(Default)]
pub struct MemoryCounterStore {
    states: Mutex<HashMap<CounterKey, CumulativeCounterState>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: CounterKey, state: CumulativeCounterState) {
        self.lock().insert(key, state);
    }

    pub fn get(&self, key: &CounterKey) -> Option<CumulativeCounterState> {
        self.lock().get(key).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CounterKey, CumulativeCounterState>> {
        // A poisoned map still holds valid Copy values
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn load(&self, key: &CounterKey) -> Result<Option<CumulativeCounterState>> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &CounterKey, state: &CumulativeCounterState) -> Result<()> {
        self.insert(key.clone(), *state);
        Ok(())
    }
}
