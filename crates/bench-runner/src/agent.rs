use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::catalog::TaskDescriptor;
use crate::error::AgentError;
use crate::protocol::{ExecutionOutput, GuiPrimitive};

pub const AGENT_REQUEST_SCHEMA_V1: &str = "agent_decide_request_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Code {
        code: String,
    },
    Gui {
        primitives: Vec<GuiPrimitive>,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
    },
    GiveUp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Done { .. } | Action::GiveUp { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl Decision {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            thought: None,
            usage: TokenUsage::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Observation,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub step: usize,
    pub content: Value,
    pub timestamp: String,
}

impl Message {
    pub fn new(role: Role, step: usize, content: Value) -> Self {
        Self {
            role,
            step,
            content,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<ExecutionOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_error: Option<String>,
}

/// Decision policy driven by the control loop; one instance per task.
pub trait Agent {
    fn decide(
        &mut self,
        history: &[Message],
        observation: &Observation,
    ) -> std::result::Result<Decision, AgentError>;
}

pub trait AgentFactory: Send + Sync {
    fn start(
        &self,
        task: &TaskDescriptor,
        prompt: &str,
    ) -> std::result::Result<Box<dyn Agent>, AgentError>;
}

/// Replays a fixed list of decisions.
pub struct ScriptedAgent {
    decisions: VecDeque<Decision>,
}

impl ScriptedAgent {
    pub fn new(decisions: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            decisions: decisions.into_iter().collect(),
        }
    }

    pub fn from_actions(actions: impl IntoIterator<Item = Action>) -> Self {
        Self::new(actions.into_iter().map(Decision::new))
    }
}

impl Agent for ScriptedAgent {
    fn decide(
        &mut self,
        _history: &[Message],
        _observation: &Observation,
    ) -> std::result::Result<Decision, AgentError> {
        self.decisions
            .pop_front()
            .ok_or_else(|| AgentError("scripted agent has no decisions left".to_string()))
    }
}

/// Scripts keyed by task id, with `*` as the fallback.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgentFactory {
    scripts: BTreeMap<String, Vec<Decision>>,
}

impl ScriptedAgentFactory {
    pub fn for_all_tasks(decisions: Vec<Decision>) -> Self {
        let mut scripts = BTreeMap::new();
        scripts.insert("*".to_string(), decisions);
        Self { scripts }
    }

    pub fn with_task(mut self, task_id: &str, decisions: Vec<Decision>) -> Self {
        self.scripts.insert(task_id.to_string(), decisions);
        self
    }

    /// Accepts either a list of decisions (or bare actions) applied to every
    /// task, or an object mapping task ids to such lists.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| anyhow!("failed to read agent script {}: {}", path.display(), err))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| anyhow!("agent script {} is not JSON: {}", path.display(), err))?;
        let mut factory = Self::default();
        match value {
            Value::Array(_) => {
                factory
                    .scripts
                    .insert("*".to_string(), parse_script(&value)?);
            }
            Value::Object(map) => {
                for (task_id, script) in map {
                    let decisions = parse_script(&script)
                        .map_err(|err| anyhow!("agent script for '{}': {}", task_id, err))?;
                    factory.scripts.insert(task_id, decisions);
                }
            }
            _ => {
                return Err(anyhow!(
                    "agent script {} must be a list or an object keyed by task id",
                    path.display()
                ))
            }
        }
        Ok(factory)
    }
}

fn parse_script(value: &Value) -> Result<Vec<Decision>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow!("script must be a list"))?;
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let decision = if item.get("action").is_some() {
                serde_json::from_value::<Decision>(item.clone())
            } else {
                serde_json::from_value::<Action>(item.clone()).map(Decision::new)
            };
            decision.map_err(|err| anyhow!("entry {} is not a decision: {}", idx, err))
        })
        .collect()
}

impl AgentFactory for ScriptedAgentFactory {
    fn start(
        &self,
        task: &TaskDescriptor,
        _prompt: &str,
    ) -> std::result::Result<Box<dyn Agent>, AgentError> {
        let script = self
            .scripts
            .get(&task.id)
            .or_else(|| self.scripts.get("*"))
            .ok_or_else(|| AgentError(format!("no agent script for task '{}'", task.id)))?;
        Ok(Box::new(ScriptedAgent::new(script.clone())))
    }
}

/// Spawns an external program once per decision: the request goes to its
/// stdin as JSON and the decision is read from its stdout.
#[derive(Debug, Clone)]
pub struct CommandAgentFactory {
    command: Vec<String>,
    timeout: Duration,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandAgentFactory {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(anyhow!("agent command must not be empty"));
        }
        Ok(Self {
            command,
            timeout,
            env: BTreeMap::new(),
            working_dir: None,
        })
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl AgentFactory for CommandAgentFactory {
    fn start(
        &self,
        task: &TaskDescriptor,
        prompt: &str,
    ) -> std::result::Result<Box<dyn Agent>, AgentError> {
        Ok(Box::new(CommandAgent {
            config: self.clone(),
            task: json!({
                "id": task.id,
                "snapshot": task.snapshot,
                "instruction": task.instruction,
                "action_number": task.action_number,
            }),
            prompt: prompt.to_string(),
        }))
    }
}

pub struct CommandAgent {
    config: CommandAgentFactory,
    task: Value,
    prompt: String,
}

struct ProcessRunResult {
    status: String,
    stdout: String,
    stderr: String,
}

impl CommandAgent {
    fn run_process(&self, input: &[u8]) -> Result<ProcessRunResult> {
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);
        cmd.envs(&self.config.env);
        if let Some(dir) = self.config.working_dir.as_ref() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            anyhow!(
                "failed to spawn agent command '{}': {}",
                self.config.command[0],
                err
            )
        })?;
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);
        if let Some(mut stdin) = child.stdin.take() {
            let input = input.to_vec();
            // A child that exits without reading stdin is reported via its status.
            thread::spawn(move || {
                let _ = stdin.write_all(&input);
            });
        }

        // Timeouts too large to represent never expire.
        let deadline = Instant::now().checked_add(self.config.timeout);
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "agent command timed out after {:?}",
                    self.config.timeout
                ));
            }
            thread::sleep(Duration::from_millis(25));
        };
        let join = |reader: Option<thread::JoinHandle<Vec<u8>>>| -> String {
            reader
                .and_then(|handle| handle.join().ok())
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                .unwrap_or_default()
        };
        Ok(ProcessRunResult {
            status: status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stdout: join(stdout_reader),
            stderr: join(stderr_reader),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

fn tail(raw: &str) -> String {
    const MAX_TAIL_CHARS: usize = 400;
    let trimmed = raw.trim();
    let count = trimmed.chars().count();
    if count <= MAX_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - MAX_TAIL_CHARS).collect()
}

impl Agent for CommandAgent {
    fn decide(
        &mut self,
        history: &[Message],
        observation: &Observation,
    ) -> std::result::Result<Decision, AgentError> {
        let request = json!({
            "schema_version": AGENT_REQUEST_SCHEMA_V1,
            "task": self.task,
            "prompt": self.prompt,
            "history": history,
            "observation": observation,
        });
        let input = serde_json::to_vec(&request)
            .map_err(|err| AgentError(format!("failed to encode agent request: {}", err)))?;
        let result = self
            .run_process(&input)
            .map_err(|err| AgentError(err.to_string()))?;
        if result.status != "0" {
            return Err(AgentError(format!(
                "agent command exited with status {}: {}",
                result.status,
                tail(&result.stderr)
            )));
        }
        // The decision is the last non-empty stdout line.
        let line = result
            .stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| AgentError("agent command produced no output".to_string()))?;
        let decision: Decision = serde_json::from_str(line.trim()).map_err(|err| {
            AgentError(format!(
                "agent output is not a decision: {} (output: {})",
                err,
                tail(line)
            ))
        })?;
        debug!(action = ?decision.action, "agent decided");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_file, TempDirGuard};

    fn task(id: &str) -> TaskDescriptor {
        serde_json::from_value(json!({
            "id": id,
            "instruction": "noop",
            "config": [],
            "evaluation": {"func": "compare_csv"}
        }))
        .expect("descriptor")
    }

    #[test]
    fn actions_are_tagged_by_type() {
        let decision: Decision = serde_json::from_value(json!({
            "action": {"type": "gui", "primitives": [{"kind": "type", "text": "hi"}]},
            "thought": "typing",
            "usage": {"input_tokens": 10, "output_tokens": 3}
        }))
        .expect("decision");
        assert_eq!(decision.usage.total(), 13);
        assert!(!decision.action.is_terminal());
        let done: Action = serde_json::from_value(json!({"type": "done"})).expect("done");
        assert!(done.is_terminal());
        assert!(serde_json::from_value::<Action>(json!({"type": "sleep"})).is_err());
    }

    #[test]
    fn scripted_agent_replays_then_errors() {
        let mut agent = ScriptedAgent::from_actions(vec![Action::Done { answer: None }]);
        let obs = Observation::default();
        assert_eq!(
            agent.decide(&[], &obs).expect("first").action,
            Action::Done { answer: None }
        );
        assert!(agent.decide(&[], &obs).is_err());
    }

    #[test]
    fn scripted_factory_loads_per_task_scripts_from_file() {
        let root = TempDirGuard::new("bench_agent_script");
        let path = root.path.join("script.json");
        write_file(
            &path,
            &json!({
                "t1": [{"type": "code", "code": "print(1)"}, {"type": "done"}],
                "*": [{"action": {"type": "give_up", "reason": "no idea"}}]
            })
            .to_string(),
        );
        let factory = ScriptedAgentFactory::from_file(&path).expect("load script");
        let mut t1 = factory.start(&task("t1"), "prompt").expect("t1 agent");
        assert!(matches!(
            t1.decide(&[], &Observation::default()).expect("decide").action,
            Action::Code { .. }
        ));
        let mut other = factory.start(&task("t9"), "prompt").expect("fallback agent");
        assert!(matches!(
            other.decide(&[], &Observation::default()).expect("decide").action,
            Action::GiveUp { .. }
        ));

        write_file(&path, "{\"t1\": [{\"type\": \"teleport\"}]}");
        let err = ScriptedAgentFactory::from_file(&path).expect_err("bad action");
        assert!(err.to_string().contains("entry 0"), "unexpected error: {}", err);
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_reads_decision_from_stdout() {
        let factory = CommandAgentFactory::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo 'thinking'; echo '{\"action\":{\"type\":\"done\",\"answer\":\"42\"}}'"
                    .to_string(),
            ],
            Duration::from_secs(10),
        )
        .expect("factory");
        let mut agent = factory.start(&task("t1"), "prompt").expect("agent");
        let decision = agent
            .decide(&[], &Observation::default())
            .expect("decision");
        assert_eq!(
            decision.action,
            Action::Done {
                answer: Some("42".to_string())
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_accepts_unbounded_timeout() {
        let factory = CommandAgentFactory::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo '{\"action\":{\"type\":\"give_up\"}}'".to_string(),
            ],
            Duration::MAX,
        )
        .expect("factory");
        let decision = factory
            .start(&task("t1"), "prompt")
            .expect("agent")
            .decide(&[], &Observation::default())
            .expect("decision");
        assert!(matches!(decision.action, Action::GiveUp { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_failures_are_agent_errors() {
        let failing = CommandAgentFactory::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'model quota exceeded' >&2; exit 3".to_string(),
            ],
            Duration::from_secs(10),
        )
        .expect("factory");
        let err = failing
            .start(&task("t1"), "prompt")
            .expect("agent")
            .decide(&[], &Observation::default())
            .expect_err("non-zero exit");
        assert!(err.0.contains("quota"), "unexpected error: {}", err);

        let slow = CommandAgentFactory::new(
            vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        )
        .expect("factory");
        let err = slow
            .start(&task("t1"), "prompt")
            .expect("agent")
            .decide(&[], &Observation::default())
            .expect_err("timeout");
        assert!(err.0.contains("timed out"), "unexpected error: {}", err);
        assert!(CommandAgentFactory::new(Vec::new(), Duration::from_secs(1)).is_err());
    }
}
