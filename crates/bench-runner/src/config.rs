use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bench_core::{
    BENCH_ENV_ACQUIRE_TIMEOUT_SECS, BENCH_ENV_ACTION_TIMEOUT_SECS, BENCH_ENV_NUM_RUNS,
    BENCH_ENV_SLACK_FACTOR, BENCH_ENV_TASK_TIMEOUT_SECS,
};

use crate::catalog::TaskDescriptor;
use crate::control_loop::{step_budget, LoopSettings};
use crate::sandbox::{SandboxEndpoints, DEFAULT_POLL_INTERVAL};

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(12 * 60);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(150);
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_NUM_RUNS: usize = 3;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are operating a sandboxed desktop. \
Complete the following task:\n{complete_task}\n\n\
You may take at most {steps} actions. Reply with one action at a time; \
send a `done` action when the task is complete or `give_up` if it cannot be done.";

/// Optional YAML campaign file; every field may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfigFile {
    #[serde(default)]
    pub sandboxes: Vec<SandboxEndpoints>,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub prompt: Option<PromptConfig>,
    #[serde(default, rename = "loop")]
    pub control_loop: LoopConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub task_secs: Option<u64>,
    pub acquire_secs: Option<u64>,
    pub action_secs: Option<u64>,
    pub campaign_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub command: Option<Vec<String>>,
    pub script: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptConfig {
    pub file: PathBuf,
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopConfig {
    pub slack_factor: Option<f64>,
    pub max_agent_steps: Option<usize>,
    pub screenshot_pointer: Option<bool>,
}

pub fn load_campaign_config(path: &Path) -> Result<CampaignConfigFile> {
    let raw = fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read campaign config {}: {}", path.display(), err))?;
    let mut config: CampaignConfigFile = serde_yaml::from_str(&raw)
        .map_err(|err| anyhow!("campaign config {} is invalid: {}", path.display(), err))?;
    // Relative paths inside the file are relative to the file.
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    if let Some(script) = config.agent.script.as_mut() {
        if script.is_relative() {
            *script = base.join(&*script);
        }
    }
    if let Some(prompt) = config.prompt.as_mut() {
        if prompt.file.is_relative() {
            prompt.file = base.join(&prompt.file);
        }
    }
    Ok(config)
}

/// Effective timeouts and loop settings after all layers are applied.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub task_timeout: Duration,
    pub acquire_timeout: Duration,
    pub campaign_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub agent_timeout: Duration,
    pub loop_settings: LoopSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            task_timeout: DEFAULT_TASK_TIMEOUT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            campaign_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            loop_settings: LoopSettings::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn apply_file(&mut self, file: &CampaignConfigFile) {
        let t = &file.timeouts;
        if let Some(secs) = t.task_secs {
            self.task_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = t.acquire_secs {
            self.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = t.action_secs {
            self.loop_settings.action_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = t.campaign_secs {
            self.campaign_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = t.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = file.agent.timeout_secs {
            self.agent_timeout = Duration::from_secs(secs);
        }
        if let Some(slack) = file.control_loop.slack_factor {
            self.loop_settings.slack_factor = slack;
        }
        if let Some(max) = file.control_loop.max_agent_steps {
            self.loop_settings.max_steps_override = Some(max);
        }
        if let Some(pointer) = file.control_loop.screenshot_pointer {
            self.loop_settings.screenshot_pointer = pointer;
        }
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(secs) = parse_optional_positive_u64_env(BENCH_ENV_TASK_TIMEOUT_SECS)? {
            self.task_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_optional_positive_u64_env(BENCH_ENV_ACQUIRE_TIMEOUT_SECS)? {
            self.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_optional_positive_u64_env(BENCH_ENV_ACTION_TIMEOUT_SECS)? {
            self.loop_settings.action_timeout = Duration::from_secs(secs);
        }
        if let Some(slack) = parse_optional_positive_f64_env(BENCH_ENV_SLACK_FACTOR)? {
            self.loop_settings.slack_factor = slack;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.loop_settings.slack_factor.is_finite() && self.loop_settings.slack_factor > 0.0) {
            return Err(anyhow!(
                "slack factor must be a positive number (got {})",
                self.loop_settings.slack_factor
            ));
        }
        for (name, value) in [
            ("task timeout", self.task_timeout),
            ("acquire timeout", self.acquire_timeout),
            ("action timeout", self.loop_settings.action_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be > 0", name));
            }
        }
        Ok(())
    }
}

pub fn resolve_num_runs(flag: Option<usize>) -> Result<usize> {
    if let Some(runs) = flag {
        if runs == 0 {
            return Err(anyhow!("--runs must be > 0"));
        }
        return Ok(runs);
    }
    Ok(parse_optional_positive_u64_env(BENCH_ENV_NUM_RUNS)?
        .map(|runs| runs as usize)
        .unwrap_or(DEFAULT_NUM_RUNS))
}

fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_optional_positive_f64_env(name: &str) -> Result<Option<f64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v > 0.0)
                .ok_or_else(|| {
                    anyhow!("{} must be a positive number when set (got: {})", name, raw)
                })?;
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

/// Reads the template stored under `key` in a YAML mapping file.
pub fn load_prompt_template(path: &Path, key: &str) -> Result<String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read prompt file {}: {}", path.display(), err))?;
    let doc: YamlValue = serde_yaml::from_str(&raw)
        .map_err(|err| anyhow!("prompt file {} is not YAML: {}", path.display(), err))?;
    let mapping = doc
        .as_mapping()
        .ok_or_else(|| anyhow!("prompt file {} must be a mapping", path.display()))?;
    match mapping.get(YamlValue::String(key.to_string())) {
        Some(YamlValue::String(template)) => Ok(template.clone()),
        Some(_) => Err(anyhow!("prompt '{}' in {} is not a string", key, path.display())),
        None => {
            let keys = mapping
                .keys()
                .filter_map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Err(anyhow!(
                "prompt key '{}' not found in {}; available: {}",
                key,
                path.display(),
                keys
            ))
        }
    }
}

pub fn render_prompt(template: &str, task: &TaskDescriptor, settings: &LoopSettings) -> String {
    template
        .replace("{complete_task}", &task.instruction)
        .replace(
            "{steps}",
            &step_budget(task.action_number, settings).to_string(),
        )
}
