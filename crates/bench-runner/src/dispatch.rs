use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use bench_core::TaskResultPaths;

use crate::builtins;
use crate::catalog::{StepSpec, TaskDescriptor};
use crate::deadline::Deadline;
use crate::error::{ConfigStepFailed, EvalFailure, TaskFailure, TimeoutError, TimeoutScope};
use crate::protocol::ProtocolError;
use crate::sandbox::{join_remote, SandboxHandle};

/// Everything a config or evaluation handler may touch for one task.
pub struct StepContext<'a> {
    pub task: &'a TaskDescriptor,
    pub sandbox: &'a SandboxHandle,
    pub asset_dir: &'a Path,
    pub result_paths: &'a TaskResultPaths,
    pub deadline: Deadline,
    pub action_timeout: Duration,
}

impl StepContext<'_> {
    pub fn call_timeout(&self) -> Duration {
        self.deadline.bound(self.action_timeout)
    }
}

pub trait ConfigAction: Send + Sync {
    fn run(&self, ctx: &StepContext<'_>, args: &StepArgs) -> Result<()>;
}

pub trait EvalAction: Send + Sync {
    /// Returns a raw score; the dispatcher clamps it to `[0, 1]`.
    fn evaluate(&self, ctx: &StepContext<'_>, args: &StepArgs) -> Result<f64, EvalFailure>;
}

/// Name to handler tables, fixed before a campaign starts.
#[derive(Clone, Default)]
pub struct StepRegistry {
    config: BTreeMap<String, Arc<dyn ConfigAction>>,
    evaluation: BTreeMap<String, Arc<dyn EvalAction>>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        builtins::register_all(&mut registry);
        registry
    }

    pub fn register_config(&mut self, name: &str, action: Arc<dyn ConfigAction>) {
        self.config.insert(name.to_string(), action);
    }

    pub fn register_eval(&mut self, name: &str, action: Arc<dyn EvalAction>) {
        self.evaluation.insert(name.to_string(), action);
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.config.contains_key(name)
    }

    pub fn has_eval(&self, name: &str) -> bool {
        self.evaluation.contains_key(name)
    }

    pub fn config_names(&self) -> Vec<String> {
        self.config.keys().cloned().collect()
    }

    pub fn eval_names(&self) -> Vec<String> {
        self.evaluation.keys().cloned().collect()
    }

    pub fn config_action(&self, name: &str) -> Result<Arc<dyn ConfigAction>> {
        self.config.get(name).cloned().ok_or_else(|| {
            anyhow!(
                "unsupported config function '{}'; supported: {}",
                name,
                self.config_names().join(", ")
            )
        })
    }

    pub fn eval_action(&self, name: &str) -> Result<Arc<dyn EvalAction>> {
        self.evaluation.get(name).cloned().ok_or_else(|| {
            anyhow!(
                "unsupported evaluation function '{}'; supported: {}",
                name,
                self.eval_names().join(", ")
            )
        })
    }
}

/// Step arguments after path normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct StepArgs {
    values: Map<String, Value>,
}

impl StepArgs {
    /// `local*` keys resolve against the asset directory, `remote*`/`vm_*`
    /// keys against the sandbox working directory. Absolute paths and
    /// non-string values are kept as given.
    pub fn normalize(raw: &Map<String, Value>, asset_dir: &Path, sandbox_workdir: &str) -> Self {
        let mut values = Map::new();
        for (key, value) in raw {
            let normalized = match value.as_str() {
                Some(path) if key.starts_with("local") && !Path::new(path).is_absolute() => {
                    Value::String(asset_dir.join(path).to_string_lossy().to_string())
                }
                Some(path)
                    if (key.starts_with("remote") || key.starts_with("vm_"))
                        && !path.starts_with('/') =>
                {
                    Value::String(join_remote(sandbox_workdir, path))
                }
                _ => value.clone(),
            };
            values.insert(key.clone(), normalized);
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// First present string among `keys`, which are aliases of one argument.
    pub fn require_str(&self, keys: &[&str]) -> Result<&str> {
        keys.iter()
            .find_map(|key| self.opt_str(key))
            .ok_or_else(|| anyhow!("missing required argument '{}'", keys.join("' or '")))
    }

    pub fn require_local_path(&self, keys: &[&str]) -> Result<PathBuf> {
        Ok(PathBuf::from(self.require_str(keys)?))
    }

    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(anyhow!("argument '{}' must be a boolean (got {})", key, other)),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// String values of the `remote*`/`vm_*` keys.
    pub fn remote_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.values
            .iter()
            .filter(|(key, _)| key.starts_with("remote") || key.starts_with("vm_"))
            .filter_map(|(_, value)| value.as_str())
    }
}

/// Every sandbox path a task's config and evaluation steps name.
pub fn task_remote_paths(
    task: &TaskDescriptor,
    asset_dir: &Path,
    sandbox_workdir: &str,
) -> Vec<String> {
    let mut paths = Vec::new();
    for step in task.config.iter().chain(std::iter::once(&task.evaluation)) {
        let args = StepArgs::normalize(&step.arguments, asset_dir, sandbox_workdir);
        for path in args.remote_paths() {
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

/// Runs config steps in order and stops at the first failure. Running out of
/// task time is reported as a timeout, not as a broken step.
pub fn run_config_steps(
    ctx: &StepContext<'_>,
    registry: &StepRegistry,
    steps: &[StepSpec],
) -> std::result::Result<usize, TaskFailure> {
    for (step_index, step) in steps.iter().enumerate() {
        let fail = |cause: String, infra: bool| {
            TaskFailure::Setup(ConfigStepFailed {
                step_index,
                name: step.func.clone(),
                cause,
                infra,
            })
        };
        let timed_out = || {
            TaskFailure::Timeout(TimeoutError {
                scope: TimeoutScope::Task,
                limit: ctx.deadline.limit().unwrap_or_default(),
                during: format!("config step {} ({})", step_index, step.func),
            })
        };
        if ctx.deadline.expired() {
            warn!(task_id = %ctx.task.id, step = step_index, func = %step.func, "task deadline expired during config");
            return Err(timed_out());
        }
        let action = registry
            .config_action(&step.func)
            .map_err(|err| fail(err.to_string(), false))?;
        let args = StepArgs::normalize(&step.arguments, ctx.asset_dir, ctx.sandbox.workdir());
        match action.run(ctx, &args) {
            Ok(()) => {
                info!(task_id = %ctx.task.id, step = step_index, func = %step.func, "config step done");
            }
            Err(err) => {
                warn!(task_id = %ctx.task.id, step = step_index, func = %step.func, error = %err, "config step failed");
                let infra = err
                    .chain()
                    .filter_map(|cause| cause.downcast_ref::<ProtocolError>())
                    .any(ProtocolError::is_unreachable);
                if !infra && ctx.deadline.expired() {
                    return Err(timed_out());
                }
                return Err(fail(format!("{:#}", err), infra));
            }
        }
    }
    Ok(steps.len())
}

/// Runs the evaluation step; scores come back clamped to `[0, 1]`.
pub fn run_evaluation(
    ctx: &StepContext<'_>,
    registry: &StepRegistry,
    step: &StepSpec,
) -> std::result::Result<f64, EvalFailure> {
    let action = registry
        .eval_action(&step.func)
        .map_err(|err| EvalFailure::invalid(err.to_string()))?;
    let args = StepArgs::normalize(&step.arguments, ctx.asset_dir, ctx.sandbox.workdir());
    let score = action.evaluate(ctx, &args)?;
    if score.is_nan() {
        return Err(EvalFailure::invalid(format!(
            "{} returned a non-numeric score",
            step.func
        )));
    }
    let clamped = score.clamp(0.0, 1.0);
    info!(task_id = %ctx.task.id, func = %step.func, score = clamped, "evaluation finished");
    Ok(clamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunState;
    use crate::testing::{FakeGateway, FakeObservation, TempDirGuard};
    use bench_core::task_result_paths;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl ConfigAction for Recording {
        fn run(&self, _ctx: &StepContext<'_>, _args: &StepArgs) -> Result<()> {
            self.calls.lock().expect("lock").push(self.name.to_string());
            if self.fail {
                Err(anyhow!("{} exploded", self.name))
            } else {
                Ok(())
            }
        }
    }

    struct FixedScore(f64);

    impl EvalAction for FixedScore {
        fn evaluate(&self, _ctx: &StepContext<'_>, _args: &StepArgs) -> Result<f64, EvalFailure> {
            Ok(self.0)
        }
    }

    fn task(config: Vec<&str>) -> TaskDescriptor {
        serde_json::from_value(json!({
            "id": "t1",
            "instruction": "noop",
            "config": config.iter().map(|f| json!({"func": f})).collect::<Vec<_>>(),
            "evaluation": {"func": "score"}
        }))
        .expect("descriptor")
    }

    #[test]
    fn normalize_resolves_local_and_remote_prefixes() {
        let raw = json!({
            "local_path": "data.csv",
            "local_abs": "/abs/data.csv",
            "remote_path": "Desktop/data.csv",
            "vm_result": "/home/user/out.csv",
            "ignore_case": true,
            "other": "keep.txt"
        });
        let args = StepArgs::normalize(
            raw.as_object().expect("object"),
            Path::new("/tasks/jupyter/t1"),
            "/home/user/work",
        );
        assert_eq!(args.opt_str("local_path"), Some("/tasks/jupyter/t1/data.csv"));
        assert_eq!(args.opt_str("local_abs"), Some("/abs/data.csv"));
        assert_eq!(args.opt_str("remote_path"), Some("/home/user/work/Desktop/data.csv"));
        assert_eq!(args.opt_str("vm_result"), Some("/home/user/out.csv"));
        assert_eq!(args.opt_str("other"), Some("keep.txt"));
        assert!(args.flag("ignore_case", false).expect("flag"));
        assert!(args.flag("strict", true).expect("default flag"));
        assert!(args.require_str(&["missing", "absent"]).is_err());
        let mut remote: Vec<_> = args.remote_paths().collect();
        remote.sort();
        assert_eq!(remote, vec!["/home/user/out.csv", "/home/user/work/Desktop/data.csv"]);
    }

    #[test]
    fn config_steps_stop_at_first_failure() {
        let root = TempDirGuard::new("bench_dispatch_config");
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = StepRegistry::empty();
        for (name, fail) in [("first", false), ("second", true), ("third", false)] {
            registry.register_config(
                name,
                Arc::new(Recording {
                    name,
                    calls: Arc::clone(&calls),
                    fail,
                }),
            );
        }
        let descriptor = task(vec!["first", "second", "third"]);
        let sandbox = SandboxHandle::new(
            "sb",
            Arc::new(FakeGateway::new()),
            Arc::new(FakeObservation::new()),
            "/home/user/work",
        );
        let paths = task_result_paths(&root.path, "app", "t1");
        let ctx = StepContext {
            task: &descriptor,
            sandbox: &sandbox,
            asset_dir: &root.path,
            result_paths: &paths,
            deadline: Deadline::unbounded(),
            action_timeout: Duration::from_secs(1),
        };
        let err = match run_config_steps(&ctx, &registry, &descriptor.config) {
            Err(TaskFailure::Setup(err)) => err,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(err.step_index, 1);
        assert_eq!(err.name, "second");
        assert!(!err.infra);
        assert_eq!(*calls.lock().expect("lock"), vec!["first", "second"]);
    }

    #[test]
    fn expired_task_deadline_before_config_is_a_timeout() {
        let root = TempDirGuard::new("bench_dispatch_deadline");
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = StepRegistry::empty();
        registry.register_config(
            "first",
            Arc::new(Recording {
                name: "first",
                calls: Arc::clone(&calls),
                fail: false,
            }),
        );
        let descriptor = task(vec!["first"]);
        let sandbox = SandboxHandle::new(
            "sb",
            Arc::new(FakeGateway::new()),
            Arc::new(FakeObservation::new()),
            "/home/user/work",
        );
        let paths = task_result_paths(&root.path, "app", "t1");
        let ctx = StepContext {
            task: &descriptor,
            sandbox: &sandbox,
            asset_dir: &root.path,
            result_paths: &paths,
            deadline: Deadline::after(Duration::ZERO),
            action_timeout: Duration::from_secs(1),
        };
        let err = run_config_steps(&ctx, &registry, &descriptor.config)
            .expect_err("deadline already passed");
        assert_eq!(err.state(), RunState::TimeoutError);
        assert!(err.to_string().contains("config step 0 (first)"), "unexpected error: {}", err);
        assert!(calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn unknown_names_fail_closed_and_scores_are_clamped() {
        let root = TempDirGuard::new("bench_dispatch_unknown");
        let mut registry = StepRegistry::empty();
        registry.register_eval("score", Arc::new(FixedScore(1.7)));
        registry.register_eval("nan", Arc::new(FixedScore(f64::NAN)));
        let descriptor = task(vec!["install_everything"]);
        let sandbox = SandboxHandle::new(
            "sb",
            Arc::new(FakeGateway::new()),
            Arc::new(FakeObservation::new()),
            "/home/user/work",
        );
        let paths = task_result_paths(&root.path, "app", "t1");
        let ctx = StepContext {
            task: &descriptor,
            sandbox: &sandbox,
            asset_dir: &root.path,
            result_paths: &paths,
            deadline: Deadline::unbounded(),
            action_timeout: Duration::from_secs(1),
        };
        let err = run_config_steps(&ctx, &registry, &descriptor.config)
            .expect_err("unknown config function");
        assert_eq!(err.state(), RunState::SetupError);
        assert!(err.to_string().contains("install_everything"), "unexpected error: {}", err);

        let score = run_evaluation(&ctx, &registry, &descriptor.evaluation).expect("score");
        assert_eq!(score, 1.0);
        let nan = StepSpec {
            func: "nan".to_string(),
            arguments: Map::new(),
        };
        assert!(matches!(
            run_evaluation(&ctx, &registry, &nan),
            Err(EvalFailure::Invalid(_))
        ));
        let unknown = StepSpec {
            func: "compare_pixels".to_string(),
            arguments: Map::new(),
        };
        match run_evaluation(&ctx, &registry, &unknown) {
            Err(EvalFailure::Invalid(err)) => {
                assert!(err.cause.contains("compare_pixels"), "unexpected error: {}", err)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
