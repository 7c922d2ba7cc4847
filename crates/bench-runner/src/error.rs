use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::ProtocolError;

/// Final state recorded for one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Success,
    GiveUp,
    MaxStepsError,
    SetupError,
    AgentError,
    InfraError,
    EvalError,
    TimeoutError,
    OrchestratorError,
}

impl RunState {
    pub const ALL: [RunState; 9] = [
        RunState::Success,
        RunState::GiveUp,
        RunState::MaxStepsError,
        RunState::SetupError,
        RunState::AgentError,
        RunState::InfraError,
        RunState::EvalError,
        RunState::TimeoutError,
        RunState::OrchestratorError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Success => "success",
            RunState::GiveUp => "give_up",
            RunState::MaxStepsError => "max_steps_error",
            RunState::SetupError => "setup_error",
            RunState::AgentError => "agent_error",
            RunState::InfraError => "infra_error",
            RunState::EvalError => "eval_error",
            RunState::TimeoutError => "timeout_error",
            RunState::OrchestratorError => "orchestrator_error",
        }
    }

    /// States after which the sandbox is still scored.
    pub fn is_scored(self) -> bool {
        matches!(
            self,
            RunState::Success | RunState::GiveUp | RunState::MaxStepsError
        )
    }

    pub fn is_error(self) -> bool {
        !matches!(self, RunState::Success | RunState::GiveUp)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        RunState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == raw.trim())
            .ok_or_else(|| {
                format!(
                    "unknown run state '{}'; expected one of: {}",
                    raw,
                    RunState::ALL
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("task descriptor for {app}/{task_id} not found at {}", path.display())]
    Missing {
        app: String,
        task_id: String,
        path: PathBuf,
    },
    #[error("task descriptor {} is unreadable: {cause}", path.display())]
    Unreadable { path: PathBuf, cause: String },
    #[error("task descriptor {} is invalid: {cause}", path.display())]
    Invalid { path: PathBuf, cause: String },
    #[error("task index {} is invalid: {cause}", path.display())]
    InvalidIndex { path: PathBuf, cause: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("no sandbox became ready within {waited:?}: {detail}")]
pub struct SandboxUnavailable {
    pub waited: Duration,
    pub detail: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("config step {step_index} ({name}) failed: {cause}")]
pub struct ConfigStepFailed {
    pub step_index: usize,
    pub name: String,
    pub cause: String,
    /// Set when the step failed because a sandbox service was unreachable.
    pub infra: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("agent failed to produce an action: {0}")]
pub struct AgentError(pub String);

#[derive(Debug, Clone, thiserror::Error)]
#[error("sandbox infrastructure failure: {0}")]
pub struct InfraError(pub String);

impl From<ProtocolError> for InfraError {
    fn from(err: ProtocolError) -> Self {
        InfraError(err.to_string())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("evaluation could not run: {cause}")]
pub struct EvaluationError {
    pub cause: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    Action,
    Task,
    Campaign,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutScope::Action => "action",
            TimeoutScope::Task => "task",
            TimeoutScope::Campaign => "campaign",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{scope} deadline of {limit:?} exceeded during {during}")]
pub struct TimeoutError {
    pub scope: TimeoutScope,
    pub limit: Duration,
    pub during: String,
}

/// Why an evaluation function did not return a score.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalFailure {
    #[error(transparent)]
    Invalid(#[from] EvaluationError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("evaluation timed out: {0}")]
    Timeout(String),
}

impl EvalFailure {
    pub fn invalid(cause: impl Into<String>) -> Self {
        EvalFailure::Invalid(EvaluationError {
            cause: cause.into(),
        })
    }
}

/// Task-level failures; these become run records, never campaign aborts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Setup(#[from] ConfigStepFailed),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("orchestrator error: {0}")]
    Orchestrator(String),
}

impl TaskFailure {
    pub fn state(&self) -> RunState {
        match self {
            TaskFailure::Setup(step) if step.infra => RunState::InfraError,
            TaskFailure::Setup(_) => RunState::SetupError,
            TaskFailure::Agent(_) => RunState::AgentError,
            TaskFailure::Infra(_) => RunState::InfraError,
            TaskFailure::Evaluation(_) => RunState::EvalError,
            TaskFailure::Timeout(_) => RunState::TimeoutError,
            TaskFailure::Orchestrator(_) => RunState::OrchestratorError,
        }
    }

    pub fn is_infra(&self) -> bool {
        self.state() == RunState::InfraError
    }
}

/// Conditions that halt the remaining queue of a campaign.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error(transparent)]
    SandboxUnavailable(#[from] SandboxUnavailable),
    #[error("campaign deadline of {limit:?} exceeded after {attempted} attempted tasks")]
    CampaignTimeout { limit: Duration, attempted: usize },
    #[error("campaign interrupted by operator after {attempted} attempted tasks")]
    Interrupted { attempted: usize },
    #[error(transparent)]
    TaskIndex(#[from] CatalogError),
    #[error("failed to persist results: {0}")]
    Persist(#[source] anyhow::Error),
    #[error("campaign could not start: {0}")]
    Startup(#[source] anyhow::Error),
    #[error("repetition run{run} failed; remaining repetitions skipped: {source}")]
    RepetitionFailed {
        run: usize,
        #[source]
        source: Box<CampaignError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_round_trips_through_strings() {
        for state in RunState::ALL {
            let parsed: RunState = state.as_str().parse().expect("parse state");
            assert_eq!(parsed, state);
            let json = serde_json::to_string(&state).expect("serialize");
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        let err = "finished".parse::<RunState>().expect_err("unknown state");
        assert!(err.contains("max_steps_error"), "unexpected error: {}", err);
    }

    #[test]
    fn infra_flagged_setup_failures_map_to_infra_state() {
        let setup = TaskFailure::Setup(ConfigStepFailed {
            step_index: 0,
            name: "upload_file_to_vm".to_string(),
            cause: "missing".to_string(),
            infra: false,
        });
        assert_eq!(setup.state(), RunState::SetupError);
        let infra = TaskFailure::Setup(ConfigStepFailed {
            step_index: 0,
            name: "upload_file_to_vm".to_string(),
            cause: "connection refused".to_string(),
            infra: true,
        });
        assert_eq!(infra.state(), RunState::InfraError);
        assert!(infra.is_infra());
    }
}
