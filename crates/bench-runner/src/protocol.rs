use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const GATEWAY_HEALTH_PATH: &str = "/health";
pub const GATEWAY_EXECUTE_PATH: &str = "/execute";
pub const GATEWAY_RESTART_PATH: &str = "/restart";
pub const OBSERVATION_HEALTH_PATH: &str = "/health";
pub const OBSERVATION_SCREENSHOT_PATH: &str = "/screenshot";
pub const OBSERVATION_ACTION_PATH: &str = "/action";

const FILE_MARKER: &str = "BENCH_FILE:";
const MISSING_MARKER: &str = "BENCH_MISSING";
const COMMAND_MARKER: &str = "BENCH_CMD:";
const OK_MARKER: &str = "BENCH_OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The call did not finish inside its timeout.
    Timeout,
    /// The service could not be reached or answered as unavailable.
    Unreachable,
    /// The service answered, but refused the request or returned garbage.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
    message: String,
}

impl ProtocolError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ProtocolErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: ProtocolErrorKind::Unreachable,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: ProtocolErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ProtocolErrorKind {
        self.kind
    }

    pub fn is_unreachable(&self) -> bool {
        self.kind == ProtocolErrorKind::Unreachable
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ProtocolErrorKind::Timeout
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProtocolError {}

/// Status codes that mean the service behind the endpoint is not serving.
pub fn is_unavailable_http_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

pub fn truncate_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 512;
    let normalized = raw.replace('\n', " ");
    if normalized.chars().count() <= MAX_ERROR_BODY_CHARS {
        return normalized;
    }
    normalized.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionOutput {
    pub fn is_error(&self) -> bool {
        self.error.as_deref().map(|e| !e.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuiPrimitive {
    Move {
        x: i64,
        y: i64,
    },
    Click {
        #[serde(default = "default_click_button")]
        button: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i64>,
    },
    Key {
        keys: String,
    },
    Type {
        text: String,
    },
}

fn default_click_button() -> String {
    "left".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionAck {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActionAck {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Code-execution service inside the sandbox.
///
/// File transfer and shell commands are expressed as Python fragments sent
/// through `execute`, so a gateway only has to implement the three endpoints.
pub trait CodeGateway: Send + Sync {
    fn health(&self, timeout: Duration) -> Result<(), ProtocolError>;

    fn execute(&self, code: &str, timeout: Duration) -> Result<ExecutionOutput, ProtocolError>;

    /// Restarts the interpreter session, dropping all kernel state.
    fn restart(&self, timeout: Duration) -> Result<(), ProtocolError>;

    fn write_file(&self, path: &str, bytes: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        let code = format!(
            "import base64, os\n\
             _p = {path}\n\
             os.makedirs(os.path.dirname(_p) or '.', exist_ok=True)\n\
             with open(_p, 'wb') as _f:\n    _f.write(base64.b64decode({payload}))\n\
             print({ok})\n",
            path = py_literal(path),
            payload = py_literal(&BASE64_STANDARD.encode(bytes)),
            ok = py_literal(OK_MARKER),
        );
        let output = self.execute(&code, timeout)?;
        expect_marker(&output, OK_MARKER, &format!("write {}", path))
    }

    /// Returns `None` when the file does not exist in the sandbox.
    fn read_file(&self, path: &str, timeout: Duration) -> Result<Option<Vec<u8>>, ProtocolError> {
        let code = format!(
            "import base64, os\n\
             _p = {path}\n\
             if os.path.isfile(_p):\n    \
             with open(_p, 'rb') as _f:\n        \
             print({file} + base64.b64encode(_f.read()).decode('ascii'))\n\
             else:\n    print({missing})\n",
            path = py_literal(path),
            file = py_literal(FILE_MARKER),
            missing = py_literal(MISSING_MARKER),
        );
        let output = self.execute(&code, timeout)?;
        if let Some(err) = output.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(ProtocolError::rejected(format!(
                "read {} failed: {}",
                path, err
            )));
        }
        for line in output.stdout.lines() {
            let line = line.trim();
            if line == MISSING_MARKER {
                return Ok(None);
            }
            if let Some(encoded) = line.strip_prefix(FILE_MARKER) {
                let bytes = BASE64_STANDARD.decode(encoded).map_err(|err| {
                    ProtocolError::rejected(format!("read {} returned invalid base64: {}", path, err))
                })?;
                return Ok(Some(bytes));
            }
        }
        Err(ProtocolError::rejected(format!(
            "read {} produced no file marker",
            path
        )))
    }

    fn run_command(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput, ProtocolError> {
        let env_json = serde_json::to_string(env)
            .map_err(|err| ProtocolError::rejected(format!("encode command env: {}", err)))?;
        let code = format!(
            "import json, os, subprocess\n\
             _env = dict(os.environ)\n\
             _env.update(json.loads({env}))\n\
             _r = subprocess.run({command}, shell=True, capture_output=True, text=True, env=_env)\n\
             print({marker} + json.dumps({{'status': _r.returncode, 'stdout': _r.stdout, 'stderr': _r.stderr}}))\n",
            env = py_literal(&env_json),
            command = py_literal(command),
            marker = py_literal(COMMAND_MARKER),
        );
        let output = self.execute(&code, timeout)?;
        if let Some(err) = output.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(ProtocolError::rejected(format!(
                "command '{}' could not start: {}",
                command, err
            )));
        }
        let payload = output
            .stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix(COMMAND_MARKER))
            .ok_or_else(|| {
                ProtocolError::rejected(format!("command '{}' produced no status", command))
            })?;
        let value: Value = serde_json::from_str(payload).map_err(|err| {
            ProtocolError::rejected(format!("command '{}' status is not JSON: {}", command, err))
        })?;
        Ok(CommandOutput {
            status: value.get("status").and_then(Value::as_i64).unwrap_or(-1) as i32,
            stdout: value
                .get("stdout")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            stderr: value
                .get("stderr")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Removes everything below `dir` and recreates it empty.
    fn clear_dir(&self, dir: &str, timeout: Duration) -> Result<(), ProtocolError> {
        let code = format!(
            "import os, shutil\n\
             _d = {dir}\n\
             shutil.rmtree(_d, ignore_errors=True)\n\
             os.makedirs(_d, exist_ok=True)\n\
             print({ok})\n",
            dir = py_literal(dir),
            ok = py_literal(OK_MARKER),
        );
        let output = self.execute(&code, timeout)?;
        expect_marker(&output, OK_MARKER, &format!("clear {}", dir))
    }

    /// Deletes the listed files; missing paths and directories are left alone.
    fn remove_files(&self, paths: &[String], timeout: Duration) -> Result<(), ProtocolError> {
        let paths_json = serde_json::to_string(paths)
            .map_err(|err| ProtocolError::rejected(format!("encode paths: {}", err)))?;
        let code = format!(
            "import json, os\n\
             for _p in json.loads({paths}):\n    \
             if os.path.isfile(_p) or os.path.islink(_p):\n        os.remove(_p)\n\
             print({ok})\n",
            paths = py_literal(&paths_json),
            ok = py_literal(OK_MARKER),
        );
        let output = self.execute(&code, timeout)?;
        expect_marker(&output, OK_MARKER, &format!("remove {} files", paths.len()))
    }
}

/// Screen capture and input injection inside the sandbox.
pub trait ObservationService: Send + Sync {
    fn health(&self, timeout: Duration) -> Result<(), ProtocolError>;

    fn screenshot(&self, pointer: bool, timeout: Duration) -> Result<Screenshot, ProtocolError>;

    fn perform(
        &self,
        actions: &[GuiPrimitive],
        timeout: Duration,
    ) -> Result<ActionAck, ProtocolError>;
}

// JSON string literals are valid Python string literals.
fn py_literal(raw: &str) -> String {
    serde_json::to_string(raw).unwrap_or_else(|_| format!("'{}'", raw.replace('\'', "\\'")))
}

fn expect_marker(output: &ExecutionOutput, marker: &str, what: &str) -> Result<(), ProtocolError> {
    if let Some(err) = output.error.as_deref().filter(|e| !e.is_empty()) {
        return Err(ProtocolError::rejected(format!("{} failed: {}", what, err)));
    }
    if output.stdout.lines().any(|line| line.trim() == marker) {
        Ok(())
    } else {
        Err(ProtocolError::rejected(format!(
            "{} did not confirm completion (stderr: {})",
            what,
            truncate_error_body(&output.stderr)
        )))
    }
}

/// Parses the `BENCH_FILE:` / `BENCH_MISSING` convention; used by fakes that
/// answer file fragments directly.
pub fn file_fragment_response(contents: Option<&[u8]>) -> ExecutionOutput {
    let stdout = match contents {
        Some(bytes) => format!("{}{}\n", FILE_MARKER, BASE64_STANDARD.encode(bytes)),
        None => format!("{}\n", MISSING_MARKER),
    };
    ExecutionOutput {
        stdout,
        ..ExecutionOutput::default()
    }
}

pub fn ok_fragment_response() -> ExecutionOutput {
    ExecutionOutput {
        stdout: format!("{}\n", OK_MARKER),
        ..ExecutionOutput::default()
    }
}

pub fn command_fragment_response(status: i32, stdout: &str, stderr: &str) -> ExecutionOutput {
    let payload = serde_json::json!({"status": status, "stdout": stdout, "stderr": stderr});
    ExecutionOutput {
        stdout: format!("{}{}\n", COMMAND_MARKER, payload),
        ..ExecutionOutput::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoGateway {
        codes: Mutex<Vec<String>>,
        reply: ExecutionOutput,
    }

    impl CodeGateway for EchoGateway {
        fn health(&self, _timeout: Duration) -> Result<(), ProtocolError> {
            Ok(())
        }

        fn execute(&self, code: &str, _timeout: Duration) -> Result<ExecutionOutput, ProtocolError> {
            self.codes.lock().expect("lock").push(code.to_string());
            Ok(self.reply.clone())
        }

        fn restart(&self, _timeout: Duration) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    #[test]
    fn read_file_decodes_marker_and_reports_missing() {
        let present = EchoGateway {
            codes: Mutex::new(Vec::new()),
            reply: file_fragment_response(Some(b"a,b\n1,2\n")),
        };
        let bytes = present
            .read_file("/home/user/out.csv", Duration::from_secs(1))
            .expect("read")
            .expect("present");
        assert_eq!(bytes, b"a,b\n1,2\n");
        let code = present.codes.lock().expect("lock")[0].clone();
        assert!(code.contains("\"/home/user/out.csv\""), "code: {}", code);

        let missing = EchoGateway {
            codes: Mutex::new(Vec::new()),
            reply: file_fragment_response(None),
        };
        assert!(missing
            .read_file("/nope", Duration::from_secs(1))
            .expect("read")
            .is_none());
    }

    #[test]
    fn execution_errors_surface_as_rejections() {
        let gateway = EchoGateway {
            codes: Mutex::new(Vec::new()),
            reply: ExecutionOutput {
                error: Some("PermissionError: denied".to_string()),
                ..ExecutionOutput::default()
            },
        };
        let err = gateway
            .write_file("/root/x", b"data", Duration::from_secs(1))
            .expect_err("write should fail");
        assert_eq!(err.kind(), ProtocolErrorKind::Rejected);
        assert!(err.to_string().contains("PermissionError"));
    }

    #[test]
    fn run_command_parses_status_payload() {
        let gateway = EchoGateway {
            codes: Mutex::new(Vec::new()),
            reply: command_fragment_response(3, "out", "boom"),
        };
        let mut env = BTreeMap::new();
        env.insert("TASK_SETUP_LOG".to_string(), "/tmp/setup.log".to_string());
        let output = gateway
            .run_command("chmod +x /s.sh && /s.sh", &env, Duration::from_secs(1))
            .expect("run");
        assert_eq!(output.status, 3);
        assert_eq!(output.stderr, "boom");
        let code = gateway.codes.lock().expect("lock")[0].clone();
        assert!(code.contains("TASK_SETUP_LOG"));
    }

    #[test]
    fn remove_files_sends_paths_and_needs_confirmation() {
        let gateway = EchoGateway {
            codes: Mutex::new(Vec::new()),
            reply: ok_fragment_response(),
        };
        gateway
            .remove_files(&["/tmp/out.csv".to_string()], Duration::from_secs(1))
            .expect("remove");
        let code = gateway.codes.lock().expect("lock")[0].clone();
        assert!(code.contains("/tmp/out.csv"), "code: {}", code);

        let silent = EchoGateway {
            codes: Mutex::new(Vec::new()),
            reply: ExecutionOutput::default(),
        };
        let err = silent
            .remove_files(&["/tmp/out.csv".to_string()], Duration::from_secs(1))
            .expect_err("no marker");
        assert_eq!(err.kind(), ProtocolErrorKind::Rejected);
    }

    #[test]
    fn gui_primitives_use_kind_tags() {
        let click: GuiPrimitive =
            serde_json::from_value(serde_json::json!({"kind": "click", "x": 3, "y": 4}))
                .expect("parse click");
        assert_eq!(
            click,
            GuiPrimitive::Click {
                button: "left".to_string(),
                x: Some(3),
                y: Some(4)
            }
        );
        assert!(serde_json::from_value::<GuiPrimitive>(serde_json::json!({"kind": "scroll"}))
            .is_err());
    }
}
