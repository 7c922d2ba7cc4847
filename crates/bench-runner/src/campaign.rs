use chrono::Utc;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use bench_core::{canonical_json_digest, task_result_paths, ArtifactStore, TaskResultPaths};

use crate::agent::{AgentFactory, Message, TokenUsage};
use crate::catalog::{load_task_index, CatalogEntry, CatalogLoader, TaskDescriptor};
use crate::config::{render_prompt, RuntimeSettings, DEFAULT_PROMPT_TEMPLATE};
use crate::control_loop::{step_budget, ControlLoop, LoopTermination};
use crate::deadline::Deadline;
use crate::dispatch::{
    run_config_steps, run_evaluation, task_remote_paths, StepContext, StepRegistry,
};
use crate::error::{CampaignError, EvalFailure, RunState, TaskFailure, TimeoutError, TimeoutScope};
use crate::recorder::{ResultRecorder, RunOutcome, RunResult, Timing, TokenTotals};
use crate::sandbox::{ReleaseOutcome, SandboxLease, SandboxPool};
use crate::sink::{
    AttemptRecord, CampaignManifestRecord, CampaignSink, JsonlCampaignSink, SkippedRecord,
    CAMPAIGN_MANIFEST_SCHEMA_V1,
};

#[derive(Debug, Clone)]
pub struct CampaignOptions {
    pub task_index_path: PathBuf,
    pub tasks_root: PathBuf,
    pub results_root: PathBuf,
    pub settings: RuntimeSettings,
    pub prompt_template: String,
    /// Checked between tasks; the in-flight task always finishes.
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl CampaignOptions {
    pub fn new(
        task_index_path: impl Into<PathBuf>,
        tasks_root: impl Into<PathBuf>,
        results_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            task_index_path: task_index_path.into(),
            tasks_root: tasks_root.into(),
            results_root: results_root.into(),
            settings: RuntimeSettings::default(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            stop_flag: None,
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub app: String,
    pub task_id: String,
    pub state: RunState,
    pub score: Option<f64>,
    pub eval_error: Option<String>,
    pub steps: usize,
    pub duration_secs: f64,
    pub total_tokens: u64,
    pub sandbox_id: String,
    pub summary_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub campaign_id: String,
    pub results_root: PathBuf,
    pub total_tasks: usize,
    pub attempted: Vec<TaskSummary>,
    pub skipped: Vec<SkippedRecord>,
}

impl CampaignReport {
    pub fn state_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for summary in &self.attempted {
            *counts.entry(summary.state.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn mean_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self.attempted.iter().filter_map(|s| s.score).collect();
        if scores.is_empty() {
            return None;
        }
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

/// What one pipeline produced before it is written to disk.
struct Attempt {
    state: RunState,
    score: Option<f64>,
    eval_error: Option<String>,
    detail: Option<String>,
    messages: Vec<Message>,
    usage: TokenUsage,
    steps: usize,
}

impl Attempt {
    fn empty() -> Self {
        Self {
            state: RunState::OrchestratorError,
            score: None,
            eval_error: None,
            detail: None,
            messages: Vec::new(),
            usage: TokenUsage::default(),
            steps: 0,
        }
    }

    fn failed(failure: TaskFailure) -> Self {
        Self::empty().fail(failure)
    }

    fn fail(mut self, failure: TaskFailure) -> Self {
        let message = failure.to_string();
        self.state = failure.state();
        self.score = None;
        self.detail = Some(message.clone());
        self.eval_error = Some(message);
        self
    }

    fn release_outcome(&self) -> ReleaseOutcome {
        match self.state {
            RunState::InfraError => ReleaseOutcome::InfraFailure,
            state if state.is_error() => ReleaseOutcome::TaskFailed,
            _ => ReleaseOutcome::Clean,
        }
    }
}

/// Runs every indexed task once, in index order, against a shared pool.
pub struct Campaign<'a> {
    options: &'a CampaignOptions,
    pool: &'a SandboxPool,
    registry: &'a StepRegistry,
    agents: &'a dyn AgentFactory,
}

impl<'a> Campaign<'a> {
    pub fn new(
        options: &'a CampaignOptions,
        pool: &'a SandboxPool,
        registry: &'a StepRegistry,
        agents: &'a dyn AgentFactory,
    ) -> Self {
        Self {
            options,
            pool,
            registry,
            agents,
        }
    }

    pub fn run(&self) -> Result<CampaignReport, CampaignError> {
        let opts = self.options;
        let index = load_task_index(&opts.task_index_path)?;
        let loader =
            CatalogLoader::new(&opts.tasks_root, self.registry).map_err(CampaignError::Startup)?;
        let recorder = ResultRecorder::new(&opts.results_root).map_err(CampaignError::Startup)?;
        let mut sink = JsonlCampaignSink::new(&opts.results_root).map_err(CampaignError::Persist)?;

        let campaign_id = format!("campaign_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
        sink.write_manifest(&CampaignManifestRecord {
            schema_version: CAMPAIGN_MANIFEST_SCHEMA_V1.to_string(),
            campaign_id: campaign_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            task_index_path: opts.task_index_path.display().to_string(),
            task_index_digest: canonical_json_digest(&index.to_value()),
            results_root: opts.results_root.display().to_string(),
            total_tasks: index.len(),
            sandboxes: self.pool.states().into_iter().map(|(id, _)| id).collect(),
        })
        .map_err(CampaignError::Persist)?;
        self.pool.warm_up();
        info!(
            campaign_id = %campaign_id,
            tasks = index.len(),
            sandboxes = self.pool.len(),
            results_root = %opts.results_root.display(),
            "campaign started"
        );

        let campaign_deadline = opts
            .settings
            .campaign_timeout
            .map(Deadline::after)
            .unwrap_or_else(Deadline::unbounded);
        let mut report = CampaignReport {
            campaign_id: campaign_id.clone(),
            results_root: opts.results_root.clone(),
            total_tasks: index.len(),
            attempted: Vec::new(),
            skipped: Vec::new(),
        };

        for entry in loader.resolve(&index) {
            let attempted = report.attempted.len();
            if opts.stop_requested() {
                warn!(attempted, "stop requested; remaining tasks not started");
                return Err(CampaignError::Interrupted { attempted });
            }
            if campaign_deadline.expired() {
                let limit = campaign_deadline.limit().unwrap_or_default();
                error!(attempted, limit = ?limit, "campaign deadline exceeded");
                return Err(CampaignError::CampaignTimeout { limit, attempted });
            }

            let CatalogEntry {
                app,
                task_id,
                asset_dir,
                descriptor,
            } = entry;
            let task = match descriptor {
                Ok(task) => task,
                Err(err) => {
                    warn!(app = %app, task_id = %task_id, error = %err, "skipping task");
                    let row = SkippedRecord {
                        campaign_id: campaign_id.clone(),
                        app,
                        task_id,
                        reason: err.to_string(),
                    };
                    sink.append_skipped(&row).map_err(CampaignError::Persist)?;
                    report.skipped.push(row);
                    continue;
                }
            };

            let lease = match self.pool.acquire(opts.settings.acquire_timeout) {
                Ok(lease) => lease,
                Err(err) => {
                    error!(app = %app, task_id = %task_id, error = %err, "no sandbox available; aborting campaign");
                    return Err(err.into());
                }
            };
            let summary = self.run_task(&app, &task, &asset_dir, lease, &recorder, &campaign_deadline)?;
            sink.append_attempt(&AttemptRecord {
                campaign_id: campaign_id.clone(),
                app: summary.app.clone(),
                task_id: summary.task_id.clone(),
                state: summary.state,
                score: summary.score,
                eval_error: summary.eval_error.clone(),
                steps: summary.steps,
                duration_secs: summary.duration_secs,
                total_tokens: summary.total_tokens,
                sandbox_id: Some(summary.sandbox_id.clone()),
                summary_path: summary.summary_path.display().to_string(),
            })
            .map_err(CampaignError::Persist)?;
            report.attempted.push(summary);
        }

        sink.flush().map_err(CampaignError::Persist)?;
        info!(
            campaign_id = %campaign_id,
            attempted = report.attempted.len(),
            skipped = report.skipped.len(),
            "campaign finished"
        );
        Ok(report)
    }

    fn run_task(
        &self,
        app: &str,
        task: &TaskDescriptor,
        asset_dir: &Path,
        lease: SandboxLease<'_>,
        recorder: &ResultRecorder,
        campaign_deadline: &Deadline,
    ) -> Result<TaskSummary, CampaignError> {
        let started = Utc::now();
        let sandbox_id = lease.handle().id().to_string();
        let paths = task_result_paths(&self.options.results_root, app, &task.id);
        let deadline = Deadline::after(campaign_deadline.bound(self.options.settings.task_timeout));
        info!(app, task_id = %task.id, sandbox = %sandbox_id, "task started");

        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            self.attempt(task, asset_dir, &lease, &paths, deadline)
        }))
        .unwrap_or_else(|payload| {
            let cause = panic_message(payload.as_ref());
            error!(app, task_id = %task.id, cause = %cause, "task pipeline panicked");
            Attempt::failed(TaskFailure::Orchestrator(cause))
        });
        let ended = Utc::now();

        let error_log_path = if attempt.state.is_error() {
            let detail = attempt
                .detail
                .clone()
                .unwrap_or_else(|| format!("task ended in state {}", attempt.state));
            match recorder.write_error_log(app, &task.id, attempt.state, &detail) {
                Ok(path) => Some(path.display().to_string()),
                Err(err) => {
                    warn!(app, task_id = %task.id, error = %err, "failed to write error log");
                    None
                }
            }
        } else {
            None
        };

        let release = attempt.release_outcome();
        let Attempt {
            state,
            score,
            eval_error,
            messages,
            usage,
            steps,
            ..
        } = attempt;
        let total_tokens = TokenTotals::from(usage);
        let total_timing = Timing::between(started, ended);
        let result = RunResult {
            task: task.clone(),
            app: app.to_string(),
            results: RunOutcome {
                state,
                score,
                eval_error: eval_error.clone(),
                messages,
                total_tokens,
                total_timing,
                steps,
                error_log_path,
                sandbox_id: Some(sandbox_id.clone()),
            },
        };
        let summary_path = recorder.write(&result).map_err(CampaignError::Persist)?;
        self.pool.release(lease, release);
        info!(
            app,
            task_id = %task.id,
            state = %state,
            score = ?score,
            steps,
            duration_secs = total_timing.duration,
            "task finished"
        );

        Ok(TaskSummary {
            app: app.to_string(),
            task_id: task.id.clone(),
            state,
            score,
            eval_error,
            steps,
            duration_secs: total_timing.duration,
            total_tokens: total_tokens.total_tokens,
            sandbox_id,
            summary_path,
        })
    }

    /// reset → config → agent → loop → evaluation; every failure becomes data.
    fn attempt(
        &self,
        task: &TaskDescriptor,
        asset_dir: &Path,
        lease: &SandboxLease<'_>,
        paths: &TaskResultPaths,
        deadline: Deadline,
    ) -> Attempt {
        let loop_settings = &self.options.settings.loop_settings;
        let sandbox = lease.handle();

        let targets = task_remote_paths(task, asset_dir, sandbox.workdir());
        if let Err(err) = self
            .pool
            .reset(lease, &targets, deadline.bound(loop_settings.action_timeout))
        {
            return Attempt::failed(err.into());
        }

        let ctx = StepContext {
            task,
            sandbox,
            asset_dir,
            result_paths: paths,
            deadline,
            action_timeout: loop_settings.action_timeout,
        };
        if let Err(err) = run_config_steps(&ctx, self.registry, &task.config) {
            return Attempt::failed(err);
        }

        let prompt = render_prompt(&self.options.prompt_template, task, loop_settings);
        let mut agent = match self.agents.start(task, &prompt) {
            Ok(agent) => agent,
            Err(err) => return Attempt::failed(err.into()),
        };
        let artifacts = ArtifactStore::new(&paths.artifacts_dir);
        let budget = step_budget(task.action_number, loop_settings);
        let outcome = ControlLoop::new(&task.id, sandbox, &artifacts, loop_settings, deadline)
            .run(agent.as_mut(), &prompt, budget);

        let mut attempt = Attempt {
            messages: outcome.messages,
            usage: outcome.usage,
            steps: outcome.steps,
            ..Attempt::empty()
        };
        attempt.state = match outcome.termination {
            LoopTermination::Success { .. } => RunState::Success,
            LoopTermination::GiveUp { .. } => RunState::GiveUp,
            LoopTermination::MaxSteps { budget } => {
                attempt.detail = Some(format!(
                    "agent used its step budget of {} without finishing",
                    budget
                ));
                RunState::MaxStepsError
            }
            LoopTermination::AgentFailed(err) => return attempt.fail(err.into()),
            LoopTermination::Infra(err) => return attempt.fail(err.into()),
            LoopTermination::TimedOut(err) => return attempt.fail(err.into()),
        };

        // Evaluation gets its own action budget; the agent finished in time.
        let eval_ctx = StepContext {
            deadline: Deadline::after(loop_settings.action_timeout),
            ..ctx
        };
        match run_evaluation(&eval_ctx, self.registry, &task.evaluation) {
            Ok(score) => attempt.score = Some(score),
            Err(EvalFailure::Invalid(err)) => return attempt.fail(err.into()),
            Err(EvalFailure::Infra(err)) => return attempt.fail(err.into()),
            Err(EvalFailure::Timeout(during)) => {
                return attempt.fail(
                    TimeoutError {
                        scope: TimeoutScope::Action,
                        limit: loop_settings.action_timeout,
                        during,
                    }
                    .into(),
                )
            }
        }
        attempt
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Runs the campaign `runs` times into `run1..runN` under the results root.
/// The first failed repetition aborts the rest.
pub fn run_repeated(
    options: &CampaignOptions,
    runs: usize,
    pool: &SandboxPool,
    registry: &StepRegistry,
    agents: &dyn AgentFactory,
) -> Result<Vec<CampaignReport>, CampaignError> {
    let mut reports = Vec::with_capacity(runs);
    for run in 1..=runs {
        let mut run_options = options.clone();
        run_options.results_root = options.results_root.join(format!("run{}", run));
        info!(run, runs, results_root = %run_options.results_root.display(), "repetition started");
        let report = Campaign::new(&run_options, pool, registry, agents)
            .run()
            .map_err(|err| {
                error!(run, error = %err, "repetition failed; remaining repetitions skipped");
                CampaignError::RepetitionFailed {
                    run,
                    source: Box::new(err),
                }
            })?;
        reports.push(report);
    }
    Ok(reports)
}
