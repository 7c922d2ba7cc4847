use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use bench_core::ArtifactStore;

use crate::agent::{Action, Agent, Message, Observation, Role, TokenUsage};
use crate::deadline::Deadline;
use crate::error::{AgentError, InfraError, TimeoutError, TimeoutScope};
use crate::protocol::{ExecutionOutput, ProtocolError, ProtocolErrorKind};
use crate::sandbox::SandboxHandle;

pub const DEFAULT_SLACK_FACTOR: f64 = 2.0;
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub slack_factor: f64,
    pub max_steps_override: Option<usize>,
    pub action_timeout: Duration,
    pub screenshot_pointer: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            slack_factor: DEFAULT_SLACK_FACTOR,
            max_steps_override: None,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            screenshot_pointer: true,
        }
    }
}

/// Upper bound on agent decisions for one task.
pub fn step_budget(action_number: u32, settings: &LoopSettings) -> usize {
    if let Some(max) = settings.max_steps_override {
        return max;
    }
    let slack = if settings.slack_factor.is_finite() && settings.slack_factor > 0.0 {
        settings.slack_factor
    } else {
        DEFAULT_SLACK_FACTOR
    };
    (f64::from(action_number) * slack).ceil() as usize
}

#[derive(Debug, Clone)]
pub enum LoopTermination {
    Success { answer: Option<String> },
    GiveUp { reason: Option<String> },
    MaxSteps { budget: usize },
    AgentFailed(AgentError),
    Infra(InfraError),
    TimedOut(TimeoutError),
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub termination: LoopTermination,
    pub messages: Vec<Message>,
    pub usage: TokenUsage,
    pub steps: usize,
}

enum Phase {
    Observing,
    Deciding(Observation),
    Acting(Action),
    Terminated(LoopTermination),
}

/// Drives one agent against one sandbox until a terminal state.
pub struct ControlLoop<'a> {
    sandbox: &'a SandboxHandle,
    artifacts: &'a ArtifactStore,
    settings: &'a LoopSettings,
    deadline: Deadline,
    task_id: &'a str,
}

#[derive(Default)]
struct Carry {
    last_execution: Option<ExecutionOutput>,
    last_action_error: Option<String>,
}

impl<'a> ControlLoop<'a> {
    pub fn new(
        task_id: &'a str,
        sandbox: &'a SandboxHandle,
        artifacts: &'a ArtifactStore,
        settings: &'a LoopSettings,
        deadline: Deadline,
    ) -> Self {
        Self {
            sandbox,
            artifacts,
            settings,
            deadline,
            task_id,
        }
    }

    fn call_timeout(&self) -> Duration {
        self.deadline.bound(self.settings.action_timeout)
    }

    fn timed_out(&self, during: &str) -> LoopTermination {
        LoopTermination::TimedOut(TimeoutError {
            scope: TimeoutScope::Task,
            limit: self.deadline.limit().unwrap_or_default(),
            during: during.to_string(),
        })
    }

    pub fn run(&self, agent: &mut dyn Agent, prompt: &str, budget: usize) -> LoopOutcome {
        let mut messages = vec![Message::new(Role::System, 0, Value::String(prompt.to_string()))];
        let mut usage = TokenUsage::default();
        let mut steps = 0usize;
        let mut carry = Carry::default();
        let mut phase = Phase::Observing;

        let termination = loop {
            phase = match phase {
                Phase::Observing => {
                    if steps >= budget {
                        Phase::Terminated(LoopTermination::MaxSteps { budget })
                    } else if self.deadline.expired() {
                        Phase::Terminated(self.timed_out("observation"))
                    } else {
                        match self.observe(steps, &mut carry) {
                            Ok(observation) => {
                                messages.push(Message::new(
                                    Role::Observation,
                                    steps,
                                    serde_json::to_value(&observation).unwrap_or(Value::Null),
                                ));
                                Phase::Deciding(observation)
                            }
                            Err(infra) => Phase::Terminated(LoopTermination::Infra(infra)),
                        }
                    }
                }
                Phase::Deciding(observation) => match agent.decide(&messages, &observation) {
                    Ok(decision) => {
                        steps += 1;
                        usage.add(decision.usage);
                        messages.push(Message::new(
                            Role::Assistant,
                            steps,
                            serde_json::to_value(&decision).unwrap_or(Value::Null),
                        ));
                        Phase::Acting(decision.action)
                    }
                    Err(err) => {
                        warn!(task_id = self.task_id, step = steps, error = %err, "agent failed");
                        Phase::Terminated(LoopTermination::AgentFailed(err))
                    }
                },
                Phase::Acting(Action::Done { answer }) => {
                    Phase::Terminated(LoopTermination::Success { answer })
                }
                Phase::Acting(Action::GiveUp { reason }) => {
                    Phase::Terminated(LoopTermination::GiveUp { reason })
                }
                Phase::Acting(action) => {
                    if self.deadline.expired() {
                        Phase::Terminated(self.timed_out("action"))
                    } else {
                        match self.act(&action, &mut carry) {
                            Ok(outcome) => {
                                messages.push(Message::new(Role::Tool, steps, outcome));
                                Phase::Observing
                            }
                            Err(infra) => Phase::Terminated(LoopTermination::Infra(infra)),
                        }
                    }
                }
                Phase::Terminated(termination) => break termination,
            };
        };

        info!(task_id = self.task_id, steps, budget, termination = ?termination, "control loop terminated");
        LoopOutcome {
            termination,
            messages,
            usage,
            steps,
        }
    }

    fn observe(&self, step: usize, carry: &mut Carry) -> Result<Observation, InfraError> {
        let mut observation = Observation {
            step,
            last_execution: carry.last_execution.take(),
            last_action_error: carry.last_action_error.take(),
            ..Observation::default()
        };
        match self
            .sandbox
            .observation()
            .screenshot(self.settings.screenshot_pointer, self.call_timeout())
        {
            Ok(shot) => match self.artifacts.put_bytes(&shot.bytes) {
                Ok(reference) => observation.screen = Some(reference),
                Err(err) => observation.screen_error = Some(format!("failed to store screenshot: {}", err)),
            },
            Err(err) if err.is_unreachable() => return Err(InfraError::from(err)),
            Err(err) => {
                debug!(task_id = self.task_id, step, error = %err, "screenshot unavailable");
                observation.screen_error = Some(err.to_string());
            }
        }
        Ok(observation)
    }

    /// Non-fatal failures are carried into the next observation.
    fn act(&self, action: &Action, carry: &mut Carry) -> Result<Value, InfraError> {
        match action {
            Action::Code { code } => match self.sandbox.gateway().execute(code, self.call_timeout()) {
                Ok(output) => {
                    if let Some(err) = output.error.as_ref().filter(|e| !e.is_empty()) {
                        carry.last_action_error = Some(err.clone());
                    }
                    let rendered = serde_json::to_value(&output).unwrap_or(Value::Null);
                    carry.last_execution = Some(output);
                    Ok(json!({"action": "code", "status": "completed", "output": rendered}))
                }
                Err(err) => self.action_failure("code", err, carry),
            },
            Action::Gui { primitives } => {
                match self
                    .sandbox
                    .observation()
                    .perform(primitives, self.call_timeout())
                {
                    Ok(ack) if ack.is_ok() => Ok(json!({"action": "gui", "status": "ok"})),
                    Ok(ack) => {
                        let detail = ack
                            .detail
                            .unwrap_or_else(|| format!("gui action status '{}'", ack.status));
                        carry.last_action_error = Some(detail.clone());
                        Ok(json!({"action": "gui", "status": "error", "detail": detail}))
                    }
                    Err(err) => self.action_failure("gui", err, carry),
                }
            }
            Action::Done { .. } | Action::GiveUp { .. } => Ok(json!({"action": "terminal"})),
        }
    }

    fn action_failure(
        &self,
        kind: &str,
        err: ProtocolError,
        carry: &mut Carry,
    ) -> Result<Value, InfraError> {
        match err.kind() {
            ProtocolErrorKind::Unreachable => Err(InfraError::from(err)),
            ProtocolErrorKind::Timeout | ProtocolErrorKind::Rejected => {
                warn!(task_id = self.task_id, action = kind, error = %err, "action failed");
                carry.last_action_error = Some(err.to_string());
                Ok(json!({"action": kind, "status": "failed", "error": err.to_string()}))
            }
        }
    }
}
