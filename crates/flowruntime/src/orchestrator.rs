use crate::config::RuntimeConfig;
use crate::registry::NodeRegistry;
use crate::runner::FlowRunner;
use crate::store::FlowStore;
use crate::validation::validate_definition;
use chrono::Utc;
use flowcore::{
    BroadcastQueue, Collaborators, ExecutionEvent, ExecutionLogRecord, FlowDefinition, FlowError,
    FlowId, FlowStatus,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// Outcome of auto-starting persisted flows
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub started: Vec<FlowId>,
    pub failed: Vec<(FlowId, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<FlowId>,
    pub failures: Vec<(FlowId, String)>,
}

/// Owns every running flow and the persisted definitions behind them.
///
/// This is the only entry point the outside world uses. At most one
/// runner exists per flow id; the running map's lock is held for the
/// whole of a start, stop, deploy or delete, status persistence included,
/// so operations on the same id cannot interleave.
pub struct FlowOrchestrator {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn FlowStore>,
    collaborators: Collaborators,
    config: RuntimeConfig,
    running: Mutex<HashMap<FlowId, FlowRunner>>,
}

impl FlowOrchestrator {
    /// Create an orchestrator with in-process collaborators built from `config`
    pub fn new(registry: Arc<NodeRegistry>, store: Arc<dyn FlowStore>, config: RuntimeConfig) -> Self {
        let collaborators = config.collaborators();
        Self::with_collaborators(registry, store, collaborators, config)
    }

    pub fn with_collaborators(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn FlowStore>,
        collaborators: Collaborators,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            store,
            collaborators,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Process start: report what the registry holds, then recover flows
    /// that were running when the process last went down.
    pub async fn initialize(&self) -> RecoveryReport {
        tracing::info!(
            node_types = self.registry.len(),
            "flow runtime initializing with node types: {}",
            self.registry.list_types().join(", ")
        );
        self.recover().await
    }

    /// Validate and persist a definition with status `stopped`.
    ///
    /// A running flow with the same id is stopped first. Deploying never
    /// starts anything.
    pub async fn deploy(&self, mut definition: FlowDefinition) -> Result<FlowDefinition, FlowError> {
        let report = validate_definition(&definition, &self.registry)?;
        for warning in &report.warnings {
            tracing::warn!(flow = %definition.name, "{}", warning);
        }

        if definition.id.trim().is_empty() {
            definition.id = Uuid::new_v4().to_string();
        }

        let mut running = self.running.lock().await;
        if let Some(Err(e)) = stop_runner(&mut running, &definition.id).await {
            tracing::warn!(flow_id = %definition.id, "previous runner stopped with errors: {}", e);
        }

        let now = Utc::now();
        let previous = self.store.load_definition(&definition.id).await?;
        definition.version = previous.as_ref().map_or(1, |p| p.version + 1);
        definition.created_at = previous.and_then(|p| p.created_at).or(Some(now));
        definition.updated_at = Some(now);
        definition.status = FlowStatus::Stopped;

        self.store.save_definition(&definition).await?;
        tracing::info!(flow_id = %definition.id, version = definition.version, "deployed flow '{}'", definition.name);
        Ok(definition)
    }

    /// Start a flow, replacing any runner already active for the id.
    ///
    /// Without a definition the persisted one is used.
    pub async fn start(&self, flow_id: &str, definition: Option<FlowDefinition>) -> Result<(), FlowError> {
        let mut running = self.running.lock().await;

        let mut definition = match definition {
            Some(definition) => definition,
            None => self
                .store
                .load_definition(flow_id)
                .await?
                .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?,
        };
        definition.id = flow_id.to_string();

        let replaced = match stop_runner(&mut running, flow_id).await {
            Some(result) => {
                tracing::info!(flow_id = %flow_id, "replaced runner of already running flow");
                if let Err(e) = result {
                    tracing::warn!(flow_id = %flow_id, "previous runner stopped with errors: {}", e);
                }
                true
            }
            None => false,
        };

        definition.status = FlowStatus::Running;
        definition.updated_at = Some(Utc::now());

        let runner = match FlowRunner::start(
            Arc::new(definition.clone()),
            &self.registry,
            &self.collaborators,
            self.store.clone(),
            &self.config,
        )
        .await
        {
            Ok(runner) => runner,
            Err(e) => {
                if replaced {
                    self.persist_status(flow_id, FlowStatus::Stopped).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.store.save_definition(&definition).await {
            let mut runner = runner;
            if let Err(stop_error) = runner.stop().await {
                tracing::warn!(flow_id = %flow_id, "{}", stop_error);
            }
            return Err(e.into());
        }

        running.insert(flow_id.to_string(), runner);
        Ok(())
    }

    /// Stop a flow. Succeeds without doing anything if it is not running.
    pub async fn stop(&self, flow_id: &str) -> Result<(), FlowError> {
        let mut running = self.running.lock().await;
        let Some(result) = stop_runner(&mut running, flow_id).await else {
            tracing::debug!(flow_id = %flow_id, "stop requested for flow that is not running");
            return Ok(());
        };

        self.persist_status(flow_id, FlowStatus::Stopped).await;
        result
    }

    /// Stop if running, then remove the persisted definition
    pub async fn delete(&self, flow_id: &str) -> Result<(), FlowError> {
        let mut running = self.running.lock().await;
        if let Some(Err(e)) = stop_runner(&mut running, flow_id).await {
            tracing::warn!(flow_id = %flow_id, "flow stopped with errors before delete: {}", e);
        }
        if !self.store.delete_definition(flow_id).await? {
            return Err(FlowError::NotFound(flow_id.to_string()));
        }
        tracing::info!(flow_id = %flow_id, "deleted flow");
        Ok(())
    }

    /// Start every definition persisted as running. A definition that fails
    /// to start is logged and skipped; the rest still start.
    pub async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let definitions = match self.store.list_by_status(FlowStatus::Running).await {
            Ok(definitions) => definitions,
            Err(e) => {
                tracing::error!("could not list flows to recover: {}", e);
                return report;
            }
        };

        for definition in definitions {
            let flow_id = definition.id.clone();
            match self.start(&flow_id, Some(definition)).await {
                Ok(()) => {
                    tracing::info!(flow_id = %flow_id, "recovered flow");
                    report.started.push(flow_id);
                }
                Err(e) => {
                    tracing::error!(flow_id = %flow_id, "failed to recover flow: {}", e);
                    report.failed.push((flow_id, e.to_string()));
                }
            }
        }

        tracing::info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "recovery finished"
        );
        report
    }

    /// Stop every running flow concurrently.
    ///
    /// Persisted statuses are left alone so the same flows are recovered on
    /// the next start.
    pub async fn shutdown(&self) -> ShutdownReport {
        let runners: Vec<(FlowId, FlowRunner)> = self.running.lock().await.drain().collect();
        tracing::info!(flows = runners.len(), "shutting down");

        let results = join_all(runners.into_iter().map(|(flow_id, mut runner)| async move {
            let result = runner.stop().await;
            (flow_id, result)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (flow_id, result) in results {
            match result {
                Ok(()) => report.stopped.push(flow_id),
                Err(e) => {
                    tracing::warn!(flow_id = %flow_id, "flow stopped with errors: {}", e);
                    report.failures.push((flow_id, e.to_string()));
                }
            }
        }
        report
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>, FlowError> {
        Ok(self.store.load_definition(flow_id).await?)
    }

    pub async fn list_flows(&self) -> Result<Vec<FlowDefinition>, FlowError> {
        Ok(self.store.list_definitions().await?)
    }

    pub async fn is_running(&self, flow_id: &str) -> bool {
        self.running.lock().await.contains_key(flow_id)
    }

    pub async fn running_flows(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn execution_log(
        &self,
        flow_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionLogRecord>, FlowError> {
        Ok(self.store.execution_log(flow_id, limit).await?)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.collaborators.events.subscribe()
    }

    pub fn broadcast_queue(&self) -> &BroadcastQueue {
        &self.collaborators.broadcast
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    async fn persist_status(&self, flow_id: &str, status: FlowStatus) {
        let result = async {
            if let Some(mut definition) = self.store.load_definition(flow_id).await? {
                if definition.status != status {
                    definition.status = status;
                    definition.updated_at = Some(Utc::now());
                    self.store.save_definition(&definition).await?;
                }
            }
            Ok::<(), flowcore::StoreError>(())
        }
        .await;

        if let Err(e) = result {
            tracing::error!(flow_id = %flow_id, "failed to persist status {:?}: {}", status, e);
        }
    }
}

/// Take the runner for `flow_id` out of the map and stop it.
/// `None` when the flow was not running.
async fn stop_runner(
    running: &mut HashMap<FlowId, FlowRunner>,
    flow_id: &str,
) -> Option<Result<(), FlowError>> {
    let mut runner = running.remove(flow_id)?;
    Some(runner.stop().await)
}
