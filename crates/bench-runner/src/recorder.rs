use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use bench_core::{atomic_write_bytes, atomic_write_json_pretty, task_result_paths};
use bench_schemas::{compile_schema, validate_value, RUN_RESULT_SCHEMA};
use jsonschema::JSONSchema;

use crate::agent::{Message, TokenUsage};
use crate::catalog::TaskDescriptor;
use crate::error::RunState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl From<TokenUsage> for TokenTotals {
    fn from(usage: TokenUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
        }
    }
}

/// Epoch seconds; `duration` is rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
}

impl Timing {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let secs = |t: DateTime<Utc>| t.timestamp_micros() as f64 / 1_000_000.0;
        let start_time = secs(start);
        let end_time = secs(end);
        Self {
            start_time,
            end_time,
            duration: ((end_time - start_time).max(0.0) * 100.0).round() / 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub state: RunState,
    pub score: Option<f64>,
    pub eval_error: Option<String>,
    pub messages: Vec<Message>,
    pub total_tokens: TokenTotals,
    pub total_timing: Timing,
    #[serde(default)]
    pub steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
}

/// One persisted task attempt: the descriptor fields plus `app` and `results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(flatten)]
    pub task: TaskDescriptor,
    pub app: String,
    pub results: RunOutcome,
}

impl RunResult {
    /// Error states carry their message in `eval_error` so a null score is
    /// never left unexplained.
    pub fn check_invariants(&self) -> Result<()> {
        match self.results.score {
            Some(score) if !(0.0..=1.0).contains(&score) => {
                Err(anyhow!("score {} is outside [0, 1]", score))
            }
            None if self.results.eval_error.is_none() => {
                Err(anyhow!("result has neither a score nor an eval_error"))
            }
            _ => Ok(()),
        }
    }
}

pub struct ResultRecorder {
    results_root: PathBuf,
    schema: JSONSchema,
}

impl ResultRecorder {
    pub fn new(results_root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            results_root: results_root.as_ref().to_path_buf(),
            schema: compile_schema(RUN_RESULT_SCHEMA)?,
        })
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    /// Writes `<root>/<app>/<id>/summary.json`, replacing any prior record.
    pub fn write(&self, result: &RunResult) -> Result<PathBuf> {
        result.check_invariants()?;
        let value = serde_json::to_value(result)?;
        validate_value(&self.schema, &value)
            .map_err(|err| anyhow!("run result for {} failed validation: {}", result.task.id, err))?;
        let paths = task_result_paths(&self.results_root, &result.app, &result.task.id);
        atomic_write_json_pretty(&paths.summary, &value)?;
        Ok(paths.summary)
    }

    /// Writes `<result-dir>/logs/<id>_<STATE>_error_<timestamp>.log`.
    pub fn write_error_log(
        &self,
        app: &str,
        task_id: &str,
        state: RunState,
        detail: &str,
    ) -> Result<PathBuf> {
        let paths = task_result_paths(&self.results_root, app, task_id);
        let now = Utc::now();
        let path = paths.logs_dir.join(format!(
            "{}_{}_error_{}.log",
            task_id,
            state.as_str().to_uppercase(),
            now.format("%Y%m%d_%H%M%S")
        ));
        let body = format!(
            "task: {}/{}\nstate: {}\ntime: {}\n\n{}\n",
            app,
            task_id,
            state,
            now.to_rfc3339(),
            detail
        );
        atomic_write_bytes(&path, body.as_bytes())?;
        Ok(path)
    }
}
