use anyhow::Result;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use bench_core::{task_asset_dir, task_descriptor_path};
use bench_schemas::{compile_schema, validate_value, TASK_DESCRIPTOR_SCHEMA, TASK_INDEX_SCHEMA};

use crate::dispatch::StepRegistry;
use crate::error::CatalogError;

pub const DEFAULT_ACTION_NUMBER: u32 = 6;

fn default_action_number() -> u32 {
    DEFAULT_ACTION_NUMBER
}

/// One `(func, arguments)` pair from a descriptor's `config` or `evaluation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub func: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    #[serde(default)]
    pub snapshot: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub related_apps: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_action_number")]
    pub action_number: u32,
    pub config: Vec<StepSpec>,
    pub evaluation: StepSpec,
    #[serde(default)]
    pub counterpart: Option<String>,
}

/// Ordered `app -> [task id]` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIndex {
    entries: Vec<(String, Vec<String>)>,
}

impl TaskIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| "task index must be a JSON object".to_string())?;
        let mut index = TaskIndex::new();
        for (app, ids) in object {
            let ids = ids
                .as_array()
                .ok_or_else(|| format!("task list for '{}' must be an array", app))?;
            for id in ids {
                let id = id
                    .as_str()
                    .ok_or_else(|| format!("task ids for '{}' must be strings", app))?;
                index.push(app, id);
            }
            if ids.is_empty() {
                index.entries.push((app.clone(), Vec::new()));
            }
        }
        Ok(index)
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        for (app, ids) in &self.entries {
            object.insert(
                app.clone(),
                Value::Array(ids.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(object)
    }

    /// Appends a task; duplicates of an already listed pair are ignored.
    pub fn push(&mut self, app: &str, task_id: &str) {
        match self.entries.iter_mut().find(|(name, _)| name == app) {
            Some((_, ids)) => {
                if !ids.iter().any(|id| id == task_id) {
                    ids.push(task_id.to_string());
                }
            }
            None => self
                .entries
                .push((app.to_string(), vec![task_id.to_string()])),
        }
    }

    pub fn contains(&self, app: &str, task_id: &str) -> bool {
        self.entries
            .iter()
            .any(|(name, ids)| name == app && ids.iter().any(|id| id == task_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(app, ids)| ids.iter().map(move |id| (app.as_str(), id.as_str())))
    }

    pub fn apps(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(app, ids)| (app.as_str(), ids.as_slice()))
    }

    /// Number of task ids across all apps.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, ids)| ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn without_empty_apps(mut self) -> Self {
        self.entries.retain(|(_, ids)| !ids.is_empty());
        self
    }
}

pub fn load_task_index(path: &Path) -> std::result::Result<TaskIndex, CatalogError> {
    let invalid = |cause: String| CatalogError::InvalidIndex {
        path: path.to_path_buf(),
        cause,
    };
    let raw = fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
    let value: Value = serde_json::from_str(&raw).map_err(|err| invalid(err.to_string()))?;
    let schema = compile_schema(TASK_INDEX_SCHEMA).map_err(|err| invalid(err.to_string()))?;
    validate_value(&schema, &value).map_err(invalid)?;
    TaskIndex::from_value(&value).map_err(invalid)
}

pub struct CatalogEntry {
    pub app: String,
    pub task_id: String,
    pub asset_dir: PathBuf,
    pub descriptor: std::result::Result<TaskDescriptor, CatalogError>,
}

pub struct CatalogLoader<'a> {
    tasks_root: PathBuf,
    registry: &'a StepRegistry,
    schema: JSONSchema,
}

impl<'a> CatalogLoader<'a> {
    pub fn new(tasks_root: impl AsRef<Path>, registry: &'a StepRegistry) -> Result<Self> {
        let schema = compile_schema(TASK_DESCRIPTOR_SCHEMA)?;
        Ok(Self {
            tasks_root: tasks_root.as_ref().to_path_buf(),
            registry,
            schema,
        })
    }

    pub fn tasks_root(&self) -> &Path {
        &self.tasks_root
    }

    /// Lazily resolves every indexed id, in index order.
    pub fn resolve<'b>(&'b self, index: &'b TaskIndex) -> impl Iterator<Item = CatalogEntry> + 'b {
        index.iter().map(move |(app, task_id)| CatalogEntry {
            app: app.to_string(),
            task_id: task_id.to_string(),
            asset_dir: task_asset_dir(&self.tasks_root, app, task_id),
            descriptor: self.load_descriptor(app, task_id),
        })
    }

    pub fn load_descriptor(
        &self,
        app: &str,
        task_id: &str,
    ) -> std::result::Result<TaskDescriptor, CatalogError> {
        let path = task_descriptor_path(&self.tasks_root, app, task_id);
        if !path.is_file() {
            return Err(CatalogError::Missing {
                app: app.to_string(),
                task_id: task_id.to_string(),
                path,
            });
        }
        let raw = fs::read_to_string(&path).map_err(|err| CatalogError::Unreadable {
            path: path.clone(),
            cause: err.to_string(),
        })?;
        let invalid = |cause: String| CatalogError::Invalid {
            path: path.clone(),
            cause,
        };
        let value: Value =
            serde_json::from_str(&raw).map_err(|err| invalid(format!("not JSON: {}", err)))?;
        validate_value(&self.schema, &value).map_err(invalid)?;
        let descriptor: TaskDescriptor =
            serde_json::from_value(value).map_err(|err| invalid(err.to_string()))?;
        if descriptor.id != task_id {
            return Err(invalid(format!(
                "descriptor id '{}' does not match indexed id '{}'",
                descriptor.id, task_id
            )));
        }
        for (idx, step) in descriptor.config.iter().enumerate() {
            if !self.registry.has_config(&step.func) {
                return Err(invalid(format!(
                    "config[{}] names unknown function '{}'; supported: {}",
                    idx,
                    step.func,
                    self.registry.config_names().join(", ")
                )));
            }
        }
        if !self.registry.has_eval(&descriptor.evaluation.func) {
            return Err(invalid(format!(
                "evaluation names unknown function '{}'; supported: {}",
                descriptor.evaluation.func,
                self.registry.eval_names().join(", ")
            )));
        }
        Ok(descriptor)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppSummary {
    pub app: String,
    pub total: usize,
    pub valid: usize,
    pub invalid: Vec<InvalidTask>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidTask {
    pub task_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogSummary {
    pub apps: Vec<AppSummary>,
    pub total: usize,
    pub valid: usize,
}

pub fn describe_catalog(index: &TaskIndex, loader: &CatalogLoader<'_>) -> CatalogSummary {
    let mut summary = CatalogSummary::default();
    for entry in loader.resolve(index) {
        if summary.apps.last().map(|a| a.app != entry.app).unwrap_or(true) {
            summary.apps.push(AppSummary {
                app: entry.app.clone(),
                ..AppSummary::default()
            });
        }
        let Some(app) = summary.apps.last_mut() else {
            continue;
        };
        app.total += 1;
        summary.total += 1;
        match entry.descriptor {
            Ok(_) => {
                app.valid += 1;
                summary.valid += 1;
            }
            Err(err) => {
                warn!(app = %entry.app, task_id = %entry.task_id, error = %err, "invalid task descriptor");
                app.invalid.push(InvalidTask {
                    task_id: entry.task_id,
                    error: err.to_string(),
                });
            }
        }
    }
    summary
}
