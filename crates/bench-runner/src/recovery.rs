use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use bench_core::{atomic_write_json_pretty, is_atomic_write_temp, BENCH_RESULT_FILENAME};

use crate::catalog::TaskIndex;
use crate::error::RunState;

/// Finds every parseable `<app>/<id>/summary.json` under `results_root` and
/// returns it with the recorded state.
pub fn scan_result_states(results_root: &Path) -> Result<BTreeMap<(String, String), RunState>> {
    let mut found = BTreeMap::new();
    if !results_root.is_dir() {
        return Ok(found);
    }
    for entry in WalkDir::new(results_root)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable results entry");
                continue;
            }
        };
        if entry.file_name() != BENCH_RESULT_FILENAME || is_atomic_write_temp(entry.path()) {
            continue;
        }
        let Some(task_dir) = entry.path().parent() else {
            continue;
        };
        let Some(app_dir) = task_dir.parent() else {
            continue;
        };
        let (Some(task_id), Some(app)) = (
            task_dir.file_name().and_then(|n| n.to_str()),
            app_dir.file_name().and_then(|n| n.to_str()),
        ) else {
            continue;
        };
        match read_state(entry.path(), task_id) {
            Some(state) => {
                found.insert((app.to_string(), task_id.to_string()), state);
            }
            None => warn!(path = %entry.path().display(), "ignoring unparseable result record"),
        }
    }
    Ok(found)
}

fn read_state(path: &Path, task_id: &str) -> Option<RunState> {
    let raw = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    if value.get("id").and_then(Value::as_str) != Some(task_id) {
        return None;
    }
    value
        .pointer("/results/state")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

/// Task index of every present, parseable result record.
pub fn scan_results(results_root: &Path) -> Result<TaskIndex> {
    let mut index = TaskIndex::new();
    for (app, task_id) in scan_result_states(results_root)?.keys() {
        index.push(app, task_id);
    }
    Ok(index)
}

/// `expected - produced`, in expected order, without empty apps.
pub fn recover(expected: &TaskIndex, produced: &TaskIndex) -> TaskIndex {
    let mut missing = TaskIndex::new();
    for (app, task_id) in expected.iter() {
        if !produced.contains(app, task_id) {
            missing.push(app, task_id);
        }
    }
    missing.without_empty_apps()
}

/// Like `recover`, but records whose state is in `retry_states` count as missing.
pub fn recover_with_retry_states(
    expected: &TaskIndex,
    results_root: &Path,
    retry_states: &[RunState],
) -> Result<TaskIndex> {
    let states = scan_result_states(results_root)?;
    let mut produced = TaskIndex::new();
    for ((app, task_id), state) in &states {
        if !retry_states.contains(state) {
            produced.push(app, task_id);
        }
    }
    Ok(recover(expected, &produced))
}

pub fn write_task_index(path: &Path, index: &TaskIndex) -> Result<()> {
    atomic_write_json_pretty(path, &index.to_value())
}
