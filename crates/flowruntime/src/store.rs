use async_trait::async_trait;
use flowcore::{ExecutionLogRecord, FlowDefinition, FlowStatus, StoreError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// Persistence collaborator: flow definitions plus the execution log
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn load_definition(&self, id: &str) -> Result<Option<FlowDefinition>, StoreError>;

    /// Insert or replace by id
    async fn save_definition(&self, definition: &FlowDefinition) -> Result<(), StoreError>;

    /// Returns whether a definition was removed
    async fn delete_definition(&self, id: &str) -> Result<bool, StoreError>;

    /// Every definition, ordered by id
    async fn list_definitions(&self) -> Result<Vec<FlowDefinition>, StoreError>;

    async fn list_by_status(&self, status: FlowStatus) -> Result<Vec<FlowDefinition>, StoreError> {
        Ok(self
            .list_definitions()
            .await?
            .into_iter()
            .filter(|d| d.status == status)
            .collect())
    }

    async fn append_execution_log(&self, record: ExecutionLogRecord) -> Result<(), StoreError>;

    /// The newest `limit` records for one flow, oldest first
    async fn execution_log(
        &self,
        flow_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionLogRecord>, StoreError>;
}

fn newest(records: Vec<ExecutionLogRecord>, limit: usize) -> Vec<ExecutionLogRecord> {
    let skip = records.len().saturating_sub(limit);
    records.into_iter().skip(skip).collect()
}

/// Store kept entirely in memory
#[derive(Default)]
pub struct MemoryFlowStore {
    definitions: RwLock<BTreeMap<String, FlowDefinition>>,
    log: RwLock<Vec<ExecutionLogRecord>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn load_definition(&self, id: &str) -> Result<Option<FlowDefinition>, StoreError> {
        Ok(self.definitions.read().await.get(id).cloned())
    }

    async fn save_definition(&self, definition: &FlowDefinition) -> Result<(), StoreError> {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.definitions.write().await.remove(id).is_some())
    }

    async fn list_definitions(&self) -> Result<Vec<FlowDefinition>, StoreError> {
        Ok(self.definitions.read().await.values().cloned().collect())
    }

    async fn append_execution_log(&self, record: ExecutionLogRecord) -> Result<(), StoreError> {
        self.log.write().await.push(record);
        Ok(())
    }

    async fn execution_log(
        &self,
        flow_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionLogRecord>, StoreError> {
        let records = self
            .log
            .read()
            .await
            .iter()
            .filter(|r| r.flow_id == flow_id)
            .cloned()
            .collect();
        Ok(newest(records, limit))
    }
}

/// Store backed by a directory: `flows/<id>.json` per definition and an
/// `execution.log` file of JSON lines.
pub struct JsonFileStore {
    root: PathBuf,
    log_lock: Mutex<()>,
}

impl JsonFileStore {
    const LOG_FILE: &'static str = "execution.log";

    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("flows")).await?;
        Ok(Self {
            root,
            log_lock: Mutex::new(()),
        })
    }

    fn definition_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !id.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidKey(id.to_string()));
        }
        Ok(self.root.join("flows").join(format!("{id}.json")))
    }

    fn log_path(&self) -> PathBuf {
        self.root.join(Self::LOG_FILE)
    }
}

#[async_trait]
impl FlowStore for JsonFileStore {
    async fn load_definition(&self, id: &str) -> Result<Option<FlowDefinition>, StoreError> {
        let path = self.definition_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: format!("flows/{id}.json"),
                    reason: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_definition(&self, definition: &FlowDefinition) -> Result<(), StoreError> {
        let path = self.definition_path(&definition.id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(definition)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.definition_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<FlowDefinition>, StoreError> {
        let mut entries = tokio::fs::read_dir(self.root.join("flows")).await?;
        let mut definitions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<FlowDefinition>(&bytes) {
                Ok(definition) => definitions.push(definition),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable flow definition: {}", e);
                }
            }
        }
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    async fn append_execution_log(&self, record: ExecutionLogRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.log_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn execution_log(
        &self,
        flow_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionLogRecord>, StoreError> {
        let raw = match tokio::fs::read_to_string(self.log_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // A crash mid-append leaves a torn last line
        let mut records = Vec::new();
        for (number, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExecutionLogRecord>(line) {
                Ok(record) if record.flow_id == flow_id => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(line = number + 1, "skipping unreadable {} entry: {}", Self::LOG_FILE, e);
                }
            }
        }
        Ok(newest(records, limit))
    }
}
