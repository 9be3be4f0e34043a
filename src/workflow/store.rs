use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ExecutionMode;
use crate::agent::Agent;

/// Everything needed to rebuild an orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedWorkflow {
    /// Agent definitions without run state
    pub agents: Vec<Agent>,
    pub execution_mode: ExecutionMode,
    pub workflow_steps: Vec<String>,
}

/// Key-value persistence for workflow state. Missing keys load as defaults.
pub trait WorkflowStore: Send + Sync {
    fn load(&self) -> Result<PersistedWorkflow>;
    fn save(&self, state: &PersistedWorkflow) -> Result<()>;
    /// Drop every persisted key
    fn clear(&self) -> Result<()>;
}

const AGENTS_FILE: &str = "agents.json";
const MODE_FILE: &str = "execution_mode.json";
const STEPS_FILE: &str = "workflow_steps.json";

/// One JSON file per key under the data directory
pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).context(format!(
                "Failed to create data directory: {}",
                data_dir.display()
            ))?;
        }
        Ok(Self { data_dir })
    }

    fn read_key<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T> {
        let path = self.data_dir.join(file);
        if !path.exists() {
            return Ok(T::default());
        }
        let content =
            fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).context(format!("Failed to parse {}", path.display()))
    }

    fn write_key<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.data_dir.join(file);
        let content =
            serde_json::to_string_pretty(value).context(format!("Failed to serialize {}", file))?;
        fs::write(&path, content).context(format!("Failed to write {}", path.display()))
    }

    fn remove_key(&self, file: &str) -> Result<()> {
        let path = self.data_dir.join(file);
        if path.exists() {
            fs::remove_file(&path).context(format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

impl WorkflowStore for JsonFileStore {
    fn load(&self) -> Result<PersistedWorkflow> {
        Ok(PersistedWorkflow {
            agents: self.read_key(AGENTS_FILE)?,
            execution_mode: self.read_key(MODE_FILE)?,
            workflow_steps: self.read_key(STEPS_FILE)?,
        })
    }

    fn save(&self, state: &PersistedWorkflow) -> Result<()> {
        self.write_key(AGENTS_FILE, &state.agents)?;
        self.write_key(MODE_FILE, &state.execution_mode)?;
        self.write_key(STEPS_FILE, &state.workflow_steps)
    }

    fn clear(&self) -> Result<()> {
        for file in [AGENTS_FILE, MODE_FILE, STEPS_FILE] {
            self.remove_key(file)?;
        }
        Ok(())
    }
}

/// In-process store for tests
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    state: std::sync::Mutex<Option<PersistedWorkflow>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedWorkflow) -> Self {
        Self {
            state: std::sync::Mutex::new(Some(state)),
        }
    }
}

#[cfg(test)]
impl WorkflowStore for MemoryStore {
    fn load(&self) -> Result<PersistedWorkflow> {
        let state = self.state.lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        Ok(state.clone().unwrap_or_default())
    }

    fn save(&self, state: &PersistedWorkflow) -> Result<()> {
        *self.state.lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))? = Some(state.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.state.lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))? = None;
        Ok(())
    }
}
