//! In-process stand-ins for the sandbox services, shared by the unit tests.

use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::protocol::{
    ActionAck, CodeGateway, CommandOutput, ExecutionOutput, GuiPrimitive, ObservationService,
    ProtocolError, Screenshot,
};

pub(crate) struct TempDirGuard {
    pub path: PathBuf,
}

impl TempDirGuard {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&path).expect("temp dir");
        Self { path }
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

pub(crate) fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir");
    }
    fs::write(path, contents).expect("write file");
}

pub(crate) struct FakeGateway {
    pub healthy: AtomicBool,
    pub reachable: AtomicBool,
    pub restarts: AtomicUsize,
    pub command_status: AtomicI32,
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub executed: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    pub execute_replies: Mutex<VecDeque<Result<ExecutionOutput, ProtocolError>>>,
    pub removed: Mutex<Vec<String>>,
    // Code containing the trigger writes the file, standing in for agent output.
    effects: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            restarts: AtomicUsize::new(0),
            command_status: AtomicI32::new(0),
            files: Mutex::new(BTreeMap::new()),
            executed: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            execute_replies: Mutex::new(VecDeque::new()),
            removed: Mutex::new(Vec::new()),
            effects: Mutex::new(Vec::new()),
        }
    }

    pub fn put_remote_file(&self, path: &str, bytes: &[u8]) {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    pub fn queue_execute(&self, reply: Result<ExecutionOutput, ProtocolError>) {
        self.execute_replies
            .lock()
            .expect("replies lock")
            .push_back(reply);
    }

    pub fn on_execute_write(&self, trigger: &str, path: &str, bytes: &[u8]) {
        self.effects.lock().expect("effects lock").push((
            trigger.to_string(),
            path.to_string(),
            bytes.to_vec(),
        ));
    }

    fn check_reachable(&self) -> Result<(), ProtocolError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::unreachable("gateway connection refused"))
        }
    }
}

impl CodeGateway for FakeGateway {
    fn health(&self, _timeout: Duration) -> Result<(), ProtocolError> {
        self.check_reachable()?;
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::rejected("gateway reported status 'starting'"))
        }
    }

    fn execute(&self, code: &str, _timeout: Duration) -> Result<ExecutionOutput, ProtocolError> {
        self.check_reachable()?;
        self.executed
            .lock()
            .expect("executed lock")
            .push(code.to_string());
        let writes: Vec<(String, Vec<u8>)> = self
            .effects
            .lock()
            .expect("effects lock")
            .iter()
            .filter(|(trigger, _, _)| code.contains(trigger.as_str()))
            .map(|(_, path, bytes)| (path.clone(), bytes.clone()))
            .collect();
        for (path, bytes) in writes {
            self.put_remote_file(&path, &bytes);
        }
        match self.execute_replies.lock().expect("replies lock").pop_front() {
            Some(reply) => reply,
            None => Ok(ExecutionOutput::default()),
        }
    }

    fn restart(&self, _timeout: Duration) -> Result<(), ProtocolError> {
        self.check_reachable()?;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_file(&self, path: &str, bytes: &[u8], _timeout: Duration) -> Result<(), ProtocolError> {
        self.check_reachable()?;
        self.put_remote_file(path, bytes);
        Ok(())
    }

    fn read_file(&self, path: &str, _timeout: Duration) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.check_reachable()?;
        Ok(self.remote_file(path))
    }

    fn run_command(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<CommandOutput, ProtocolError> {
        self.check_reachable()?;
        self.commands
            .lock()
            .expect("commands lock")
            .push((command.to_string(), env.clone()));
        let status = self.command_status.load(Ordering::SeqCst);
        Ok(CommandOutput {
            status,
            stdout: String::new(),
            stderr: if status == 0 {
                String::new()
            } else {
                "setup script failed".to_string()
            },
        })
    }

    fn remove_files(&self, paths: &[String], _timeout: Duration) -> Result<(), ProtocolError> {
        self.check_reachable()?;
        let mut files = self.files.lock().expect("files lock");
        for path in paths {
            files.remove(path);
        }
        self.removed
            .lock()
            .expect("removed lock")
            .extend(paths.iter().cloned());
        Ok(())
    }

    fn clear_dir(&self, dir: &str, _timeout: Duration) -> Result<(), ProtocolError> {
        self.check_reachable()?;
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .lock()
            .expect("files lock")
            .retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }
}

pub(crate) struct FakeObservation {
    pub healthy: AtomicBool,
    pub reachable: AtomicBool,
    pub screenshot_failures: Mutex<VecDeque<ProtocolError>>,
    pub performed: Mutex<Vec<Vec<GuiPrimitive>>>,
    pub screenshots: AtomicUsize,
}

impl FakeObservation {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            screenshot_failures: Mutex::new(VecDeque::new()),
            performed: Mutex::new(Vec::new()),
            screenshots: AtomicUsize::new(0),
        }
    }

    fn check_reachable(&self) -> Result<(), ProtocolError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::unreachable("observation connection refused"))
        }
    }
}

impl ObservationService for FakeObservation {
    fn health(&self, _timeout: Duration) -> Result<(), ProtocolError> {
        self.check_reachable()?;
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::rejected("observation reported status 'starting'"))
        }
    }

    fn screenshot(&self, _pointer: bool, _timeout: Duration) -> Result<Screenshot, ProtocolError> {
        self.check_reachable()?;
        if let Some(err) = self
            .screenshot_failures
            .lock()
            .expect("failures lock")
            .pop_front()
        {
            return Err(err);
        }
        let n = self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(Screenshot {
            bytes: format!("frame-{}", n).into_bytes(),
            mime_type: "image/png".to_string(),
        })
    }

    fn perform(
        &self,
        actions: &[GuiPrimitive],
        _timeout: Duration,
    ) -> Result<ActionAck, ProtocolError> {
        self.check_reachable()?;
        self.performed
            .lock()
            .expect("performed lock")
            .push(actions.to_vec());
        Ok(ActionAck {
            status: "ok".to_string(),
            detail: None,
        })
    }
}
