use anyhow::Result;
use colony_domain::{ColonyError, NodeExecutionId, NodeExecutionStatus, RunId};
use colony_store_core::ConductorStore;
use serde::{Deserialize, Serialize};

/// Partition of a run's nodes around `from_node`, in recorded execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayPlan {
    pub run_id: RunId,
    pub from_node: String,
    pub nodes_to_skip: Vec<String>,
    pub nodes_to_replay: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResubmittedNode {
    pub node_id: String,
    pub exec_id: NodeExecutionId,
    pub status: NodeExecutionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryReport {
    pub run_id: RunId,
    pub dry_run: bool,
    /// Number of failed executions recorded for the run.
    pub failed_nodes: usize,
    /// Distinct node ids behind those executions, first failure first.
    pub nodes: Vec<String>,
    pub resubmitted: Vec<ResubmittedNode>,
}

/// Whatever can run a node of an existing run again.
pub trait NodeResubmitter {
    #[allow(clippy::missing_errors_doc)]
    fn resubmit(&self, run_id: RunId, node_id: &str) -> Result<ResubmittedNode>;
}

pub struct ReplayManager<'a> {
    store: &'a dyn ConductorStore,
    resubmitter: Option<&'a dyn NodeResubmitter>,
}

impl<'a> ReplayManager<'a> {
    #[must_use]
    pub fn new(store: &'a dyn ConductorStore) -> Self {
        Self {
            store,
            resubmitter: None,
        }
    }

    #[must_use]
    pub fn with_resubmitter(mut self, resubmitter: &'a dyn NodeResubmitter) -> Self {
        self.resubmitter = Some(resubmitter);
        self
    }

    /// Everything executed before `from_node` first ran is skipped; `from_node`
    /// and everything after it is replayed. Graph edges are not consulted.
    ///
    /// # Errors
    /// Returns `NotFound` when the run is unknown or `from_node` never executed
    /// in it.
    pub fn get_replay_plan(&self, run_id: RunId, from_node: &str) -> Result<ReplayPlan> {
        self.require_run(run_id)?;

        let mut ordered: Vec<String> = Vec::new();
        for execution in self.store.list_node_executions(run_id)? {
            if !ordered.contains(&execution.node_id) {
                ordered.push(execution.node_id);
            }
        }

        let position = ordered
            .iter()
            .position(|node_id| node_id == from_node)
            .ok_or_else(|| {
                ColonyError::NotFound(format!("node {from_node} has no executions in run {run_id}"))
            })?;
        let nodes_to_replay = ordered.split_off(position);

        Ok(ReplayPlan {
            run_id,
            from_node: from_node.to_string(),
            nodes_to_skip: ordered,
            nodes_to_replay,
        })
    }

    /// With `dry_run` this only reads. Otherwise each distinct failed node is
    /// handed to the resubmitter once.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown run, `Validation` when resubmission is
    /// requested without a resubmitter, or the first resubmission failure.
    pub fn retry_failed_nodes(&self, run_id: RunId, dry_run: bool) -> Result<RetryReport> {
        self.require_run(run_id)?;

        let failed: Vec<String> = self
            .store
            .list_node_executions(run_id)?
            .into_iter()
            .filter(|execution| execution.status == NodeExecutionStatus::Failed)
            .map(|execution| execution.node_id)
            .collect();
        let mut nodes: Vec<String> = Vec::new();
        for node_id in &failed {
            if !nodes.contains(node_id) {
                nodes.push(node_id.clone());
            }
        }

        let mut report = RetryReport {
            run_id,
            dry_run,
            failed_nodes: failed.len(),
            nodes,
            resubmitted: Vec::new(),
        };
        if dry_run || report.nodes.is_empty() {
            return Ok(report);
        }

        let resubmitter = self.resubmitter.ok_or_else(|| {
            ColonyError::Validation("retry requested without a node resubmitter".to_string())
        })?;
        for node_id in &report.nodes {
            let resubmitted = resubmitter.resubmit(run_id, node_id)?;
            tracing::info!(
                run_id = %run_id,
                node_id = node_id.as_str(),
                status = resubmitted.status.as_str(),
                "failed node resubmitted"
            );
            report.resubmitted.push(resubmitted);
        }
        Ok(report)
    }

    fn require_run(&self, run_id: RunId) -> Result<()> {
        if self.store.get_run(run_id)?.is_none() {
            return Err(ColonyError::NotFound(format!("run {run_id}")).into());
        }
        Ok(())
    }
}
