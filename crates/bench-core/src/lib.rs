use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const BENCH_RESULT_FILENAME: &str = "summary.json";
pub const BENCH_LOGS_DIR: &str = "logs";
pub const BENCH_ARTIFACTS_DIR: &str = "artifacts";
pub const BENCH_DOWNLOADS_DIR: &str = "downloads";
pub const BENCH_ORCHESTRATOR_LOG: &str = "orchestrator.log";
pub const BENCH_FACTS_DIR: &str = "facts";

pub const BENCH_DEFAULT_REMOTE_DIR: &str = "/home/user/Desktop";
pub const BENCH_DEFAULT_SANDBOX_WORKDIR: &str = "/home/user/work";
pub const BENCH_TASK_SETUP_LOG: &str = "task-setup.log";

pub const BENCH_ENV_TASK_SETUP_LOG: &str = "TASK_SETUP_LOG";
pub const BENCH_ENV_TASK_TIMEOUT_SECS: &str = "BENCH_TASK_TIMEOUT_SECS";
pub const BENCH_ENV_ACQUIRE_TIMEOUT_SECS: &str = "BENCH_ACQUIRE_TIMEOUT_SECS";
pub const BENCH_ENV_ACTION_TIMEOUT_SECS: &str = "BENCH_ACTION_TIMEOUT_SECS";
pub const BENCH_ENV_SLACK_FACTOR: &str = "BENCH_SLACK_FACTOR";
pub const BENCH_ENV_NUM_RUNS: &str = "BENCH_NUM_RUNS";

/// Host-side locations owned by one task attempt under the results root.
#[derive(Debug, Clone)]
pub struct TaskResultPaths {
    pub result_dir: PathBuf,
    pub summary: PathBuf,
    pub logs_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub downloads_dir: PathBuf,
}

pub fn task_result_paths(results_root: &Path, app: &str, task_id: &str) -> TaskResultPaths {
    let result_dir = results_root.join(app).join(task_id);
    TaskResultPaths {
        summary: result_dir.join(BENCH_RESULT_FILENAME),
        logs_dir: result_dir.join(BENCH_LOGS_DIR),
        artifacts_dir: result_dir.join(BENCH_ARTIFACTS_DIR),
        downloads_dir: result_dir.join(BENCH_DOWNLOADS_DIR),
        result_dir,
    }
}

pub fn task_asset_dir(tasks_root: &Path, app: &str, task_id: &str) -> PathBuf {
    tasks_root.join(app).join(task_id)
}

pub fn task_descriptor_path(tasks_root: &Path, app: &str, task_id: &str) -> PathBuf {
    task_asset_dir(tasks_root, app, task_id).join(format!("{}.json", task_id))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| {
                    let ks = serde_json::to_string(k).unwrap_or_else(|_| format!("\"{}\"", k));
                    format!("{}:{}", ks, canonical_json(v))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a sibling temp file and renames it into place, so readers
/// never observe a partially written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn is_atomic_write_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(|name| name.starts_with('.') && name.contains(".tmp."))
        .unwrap_or(false)
}

/// Content-addressed blob store; screenshots are kept here per task.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn put_bytes(&self, bytes: &[u8]) -> Result<String> {
        let digest = sha256_bytes(bytes);
        let hex = digest.strip_prefix("sha256:").unwrap_or("unknown");
        let dir = self.root.join("sha256").join(hex);
        ensure_dir(&dir)?;
        let path = dir.join("blob");
        if !path.exists() {
            atomic_write_bytes(&path, bytes)?;
        }
        Ok(format!("artifact://sha256/{}", hex))
    }

    pub fn path_for_ref(&self, artifact_ref: &str) -> Result<PathBuf> {
        let hex = artifact_ref
            .strip_prefix("artifact://sha256/")
            .ok_or_else(|| anyhow!("invalid artifact ref: {}", artifact_ref))?;
        Ok(self.root.join("sha256").join(hex).join("blob"))
    }

    pub fn read_ref(&self, artifact_ref: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_for_ref(artifact_ref)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            ensure_dir(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"d": [1, 2], "c": null}});
        let b = json!({"a": {"c": null, "d": [1, 2]}, "b": 1});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
    }

    #[test]
    fn atomic_write_replaces_existing_file_without_leaving_temp_files() {
        let root = TempDirGuard::new("bench_core_atomic");
        let target = root.path.join("nested").join("summary.json");
        atomic_write_json_pretty(&target, &json!({"n": 1})).expect("first write");
        atomic_write_json_pretty(&target, &json!({"n": 2})).expect("second write");

        let raw = fs::read_to_string(&target).expect("read back");
        let value: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["n"], 2);

        let leftovers: Vec<_> = fs::read_dir(target.parent().expect("parent"))
            .expect("list dir")
            .filter_map(|e| e.ok())
            .filter(|e| is_atomic_write_temp(&e.path()))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
    }

    #[test]
    fn artifact_store_is_content_addressed() {
        let root = TempDirGuard::new("bench_core_artifacts");
        let store = ArtifactStore::new(root.path.join("artifacts"));
        let first = store.put_bytes(b"png-bytes").expect("put");
        let second = store.put_bytes(b"png-bytes").expect("put again");
        assert_eq!(first, second);
        assert!(first.starts_with("artifact://sha256/"));
        assert_eq!(store.read_ref(&first).expect("read"), b"png-bytes");
        assert!(store.read_ref("file:///etc/passwd").is_err());
    }

    #[test]
    fn task_result_paths_are_keyed_by_app_and_task() {
        let paths = task_result_paths(Path::new("/results"), "jupyter", "t-1");
        assert_eq!(paths.result_dir, PathBuf::from("/results/jupyter/t-1"));
        assert_eq!(
            paths.summary,
            PathBuf::from("/results/jupyter/t-1/summary.json")
        );
        assert_eq!(
            task_descriptor_path(Path::new("/tasks"), "jupyter", "t-1"),
            PathBuf::from("/tasks/jupyter/t-1/t-1.json")
        );
    }
}
