use anyhow::Result;
use colony_domain::{hash_bytes, ErrorEnvelope, ErrorKind, NodeResult, NodeType, RunId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One call into the executor. Swarm and parallel nodes produce several per node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInvocation {
    pub run_id: RunId,
    pub node_id: String,
    pub invocation_id: String,
    pub node_type: NodeType,
    pub role: Option<String>,
    pub prompt: String,
    pub timeout_ms: Option<u64>,
    pub context: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeOutcome {
    pub result_text: String,
    pub result: NodeResult,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl NodeOutcome {
    #[must_use]
    pub fn success(result_text: impl Into<String>, result: NodeResult) -> Self {
        Self {
            result_text: result_text.into(),
            result,
            agent_id: None,
        }
    }

    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            result_text: message.clone(),
            result: NodeResult::failed(ErrorEnvelope::new(kind, message)),
            agent_id: None,
        }
    }
}

/// Boundary to whatever actually runs an agent for a node.
///
/// Implementations enforce `timeout_ms` themselves and report expiry as a
/// `timeout` failure, either in the outcome or as a wrapped `ColonyError::Timeout`.
pub trait NodeExecutor {
    fn executor_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, invocation: &NodeInvocation) -> Result<NodeOutcome>;
}

/// Deterministic executor that performs no work. Used for dry runs of a
/// workflow shape and in tests.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor;

impl EchoExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl NodeExecutor for EchoExecutor {
    fn executor_name(&self) -> &'static str {
        "echo"
    }

    fn execute(&self, invocation: &NodeInvocation) -> Result<NodeOutcome> {
        let token = hash_bytes(invocation.prompt.as_bytes());
        let mut result = NodeResult::default();
        result.extra.insert(
            "echo".to_string(),
            json!({
                "invocation_id": invocation.invocation_id,
                "role": invocation.role,
                "prompt_hash": token,
            }),
        );
        Ok(NodeOutcome::success(
            format!(
                "echo:{}:{}",
                invocation.invocation_id,
                token.chars().take(16).collect::<String>()
            ),
            result,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{EchoExecutor, NodeExecutor, NodeInvocation, NodeOutcome};
    use colony_domain::{ErrorKind, NodeType, RunId};
    use serde_json::json;

    #[test]
    fn echo_is_deterministic_per_prompt() {
        let invocation = NodeInvocation {
            run_id: RunId::new(),
            node_id: "scan".to_string(),
            invocation_id: "scan".to_string(),
            node_type: NodeType::Single,
            role: None,
            prompt: "scan src".to_string(),
            timeout_ms: None,
            context: json!({}),
        };
        let first = EchoExecutor.execute(&invocation).unwrap_or_else(|_| unreachable!());
        let second = EchoExecutor.execute(&invocation).unwrap_or_else(|_| unreachable!());
        assert_eq!(first, second);
        assert!(first.result_text.starts_with("echo:scan:"));
        assert!(!first.result.is_failure());
    }

    #[test]
    fn failure_outcome_carries_kind_code() {
        let outcome = NodeOutcome::failure(ErrorKind::Timeout, "exceeded 50ms");
        let error = outcome.result.error.unwrap_or_else(|| unreachable!());
        assert_eq!(error.code, "timeout");
    }
}
