//! Config and evaluation functions registered by `StepRegistry::builtin`.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use bench_core::{atomic_write_bytes, BENCH_DEFAULT_REMOTE_DIR};

use crate::dispatch::{ConfigAction, EvalAction, StepArgs, StepContext, StepRegistry};
use crate::error::{EvalFailure, InfraError};
use crate::protocol::ProtocolErrorKind;
use crate::sandbox::join_remote;

pub fn register_all(registry: &mut StepRegistry) {
    registry.register_config("upload_file_to_vm", Arc::new(UploadFile));
    registry.register_config("upload_script_and_execute", Arc::new(UploadScriptAndExecute));
    registry.register_eval("compare_csv", Arc::new(CompareCsv));
    registry.register_eval("compare_text_file", Arc::new(CompareTextFile));
    registry.register_eval("compare_notebook_cells", Arc::new(CompareNotebookCells));
    registry.register_eval("are_jupyter_outputs_cleared", Arc::new(JupyterOutputsCleared));
}

struct UploadFile;

impl ConfigAction for UploadFile {
    fn run(&self, ctx: &StepContext<'_>, args: &StepArgs) -> Result<()> {
        let local = args.require_local_path(&["local_path", "local"])?;
        let remote = args.require_str(&["remote_path", "remote"])?;
        let bytes = fs::read(&local)
            .with_context(|| format!("task asset {} is not readable", local.display()))?;
        ctx.sandbox
            .gateway()
            .write_file(remote, &bytes, ctx.call_timeout())
            .with_context(|| format!("upload to {} failed", remote))?;
        ctx.sandbox.note_remote_path(remote);
        debug!(task_id = %ctx.task.id, remote, bytes = bytes.len(), "uploaded task asset");
        Ok(())
    }
}

struct UploadScriptAndExecute;

impl ConfigAction for UploadScriptAndExecute {
    fn run(&self, ctx: &StepContext<'_>, args: &StepArgs) -> Result<()> {
        let local = args.require_local_path(&["local_path", "local"])?;
        let remote_dir = args
            .opt_str("remote_path")
            .or_else(|| args.opt_str("remote"))
            .unwrap_or(BENCH_DEFAULT_REMOTE_DIR);
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("script path {} has no file name", local.display()))?;
        let remote = join_remote(remote_dir, &file_name);
        let bytes = fs::read(&local)
            .with_context(|| format!("setup script {} is not readable", local.display()))?;
        let gateway = ctx.sandbox.gateway();
        gateway
            .write_file(&remote, &bytes, ctx.call_timeout())
            .with_context(|| format!("upload to {} failed", remote))?;
        ctx.sandbox.note_remote_path(&remote);
        let command = format!("chmod +x {} && {}", shell_quote(&remote), shell_quote(&remote));
        let output = gateway
            .run_command(&command, ctx.sandbox.runtime_env(), ctx.call_timeout())
            .with_context(|| format!("setup script {} could not run", remote))?;
        if output.status != 0 {
            return Err(anyhow!(
                "setup script {} exited with status {}: {}",
                remote,
                output.status,
                output.stderr.trim()
            ));
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Copies the produced artifact out of the sandbox. `None` means missing or
/// unreadable, which scores 0 rather than failing the evaluation.
fn fetch_produced(ctx: &StepContext<'_>, remote: &str) -> Result<Option<Vec<u8>>, EvalFailure> {
    match ctx.sandbox.gateway().read_file(remote, ctx.call_timeout()) {
        Ok(Some(bytes)) => {
            let name = Path::new(remote)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "produced".to_string());
            let local = ctx.result_paths.downloads_dir.join(name);
            if let Err(err) = atomic_write_bytes(&local, &bytes) {
                warn!(path = %local.display(), error = %err, "failed to keep downloaded artifact");
            }
            Ok(Some(bytes))
        }
        Ok(None) => {
            debug!(task_id = %ctx.task.id, remote, "produced artifact missing");
            Ok(None)
        }
        Err(err) => match err.kind() {
            ProtocolErrorKind::Unreachable => Err(EvalFailure::Infra(InfraError::from(err))),
            ProtocolErrorKind::Timeout => Err(EvalFailure::Timeout(err.to_string())),
            ProtocolErrorKind::Rejected => {
                warn!(task_id = %ctx.task.id, remote, error = %err, "produced artifact unreadable");
                Ok(None)
            }
        },
    }
}

/// Reads the expected artifact from the task assets; a copy lands in the
/// result directory.
fn read_expected(ctx: &StepContext<'_>, local: &Path) -> Result<Vec<u8>, EvalFailure> {
    let bytes = fs::read(local).map_err(|err| {
        EvalFailure::invalid(format!(
            "expected artifact {} is not readable: {}",
            local.display(),
            err
        ))
    })?;
    if let Some(name) = local.file_name() {
        let copy = ctx
            .result_paths
            .result_dir
            .join(format!("expected_{}", name.to_string_lossy()));
        if let Err(err) = atomic_write_bytes(&copy, &bytes) {
            warn!(path = %copy.display(), error = %err, "failed to keep expected artifact copy");
        }
    }
    Ok(bytes)
}

fn arg_error(err: anyhow::Error) -> EvalFailure {
    EvalFailure::invalid(err.to_string())
}

fn score(matched: bool) -> f64 {
    if matched {
        1.0
    } else {
        0.0
    }
}

struct CompareCsv;

impl EvalAction for CompareCsv {
    fn evaluate(&self, ctx: &StepContext<'_>, args: &StepArgs) -> Result<f64, EvalFailure> {
        let expected_path = args
            .require_local_path(&["local_expected", "local_path"])
            .map_err(arg_error)?;
        let remote = args
            .require_str(&["vm_result", "remote_path"])
            .map_err(arg_error)?;
        let options = CsvOptions {
            ignore_order: args.flag("ignore_order", false).map_err(arg_error)?,
            ignore_case: args.flag("ignore_case", false).map_err(arg_error)?,
            strict: args.flag("strict", true).map_err(arg_error)?,
        };

        let expected_bytes = read_expected(ctx, &expected_path)?;
        let expected = String::from_utf8(expected_bytes)
            .map_err(|_| EvalFailure::invalid("expected CSV is not UTF-8"))
            .and_then(|text| {
                parse_csv(&text).map_err(|err| {
                    EvalFailure::invalid(format!(
                        "expected CSV {} is malformed: {}",
                        expected_path.display(),
                        err
                    ))
                })
            })?;
        let Some(produced_bytes) = fetch_produced(ctx, remote)? else {
            return Ok(0.0);
        };
        let produced = match String::from_utf8(produced_bytes)
            .map_err(|err| err.to_string())
            .and_then(|text| parse_csv(&text))
        {
            Ok(table) => table,
            Err(err) => {
                warn!(task_id = %ctx.task.id, remote, error = %err, "produced CSV unreadable");
                return Ok(0.0);
            }
        };
        Ok(score(
            normalize_table(expected, &options) == normalize_table(produced, &options),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
struct CsvOptions {
    ignore_order: bool,
    ignore_case: bool,
    strict: bool,
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, CRLF.
fn parse_csv(text: &str) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                field_started = true;
            }
            ',' => {
                row.push(std::mem::take(&mut field));
                field_started = true;
            }
            '\r' => {}
            '\n' => {
                if field_started || !field.is_empty() || !row.is_empty() {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                field_started = false;
            }
            _ => {
                field.push(c);
                field_started = true;
            }
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if field_started || !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    let Some(header) = rows.first() else {
        return Err("no header row".to_string());
    };
    let width = header.len();
    for (idx, row) in rows.iter_mut().enumerate().skip(1) {
        if row.len() > width {
            return Err(format!(
                "row {} has {} fields, header has {}",
                idx + 1,
                row.len(),
                width
            ));
        }
        row.resize(width, String::new());
    }
    Ok(rows)
}

#[derive(Debug, PartialEq)]
struct NormalizedTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn normalize_cell(raw: &str, options: &CsvOptions) -> String {
    let cell = if options.strict { raw } else { raw.trim() };
    if let Ok(number) = cell.trim().parse::<f64>() {
        if number.is_finite() {
            return format!("{}", number);
        }
    }
    if options.ignore_case {
        cell.to_lowercase()
    } else {
        cell.to_string()
    }
}

/// Columns are reordered by header name so column order never matters.
/// `ignore_case` applies to values only; header names always match exactly.
fn normalize_table(mut table: Vec<Vec<String>>, options: &CsvOptions) -> NormalizedTable {
    let header: Vec<String> = table
        .remove(0)
        .iter()
        .map(|h| if options.strict { h.clone() } else { h.trim().to_string() })
        .collect();
    let mut order: Vec<usize> = (0..header.len()).collect();
    order.sort_by(|a, b| header[*a].cmp(&header[*b]));
    let mut rows: Vec<Vec<String>> = table
        .iter()
        .map(|row| order.iter().map(|&i| normalize_cell(&row[i], options)).collect())
        .collect();
    if options.ignore_order {
        rows.sort();
    }
    NormalizedTable {
        header: order.iter().map(|&i| header[i].clone()).collect(),
        rows,
    }
}

struct CompareTextFile;

impl EvalAction for CompareTextFile {
    fn evaluate(&self, ctx: &StepContext<'_>, args: &StepArgs) -> Result<f64, EvalFailure> {
        let expected_path = args
            .require_local_path(&["local_expected", "local_path"])
            .map_err(arg_error)?;
        let remote = args
            .require_str(&["vm_result", "remote_path"])
            .map_err(arg_error)?;
        let ignore_case = args.flag("ignore_case", false).map_err(arg_error)?;
        let ignore_blanks = args.flag("ignore_blanks", false).map_err(arg_error)?;

        let expected = String::from_utf8(read_expected(ctx, &expected_path)?)
            .map_err(|_| EvalFailure::invalid("expected text file is not UTF-8"))?;
        let Some(produced) = fetch_produced(ctx, remote)? else {
            return Ok(0.0);
        };
        let Ok(produced) = String::from_utf8(produced) else {
            return Ok(0.0);
        };
        let normalize = |text: &str| -> Vec<String> {
            text.lines()
                .map(|line| if ignore_blanks { line.trim_end() } else { line })
                .filter(|line| !ignore_blanks || !line.trim().is_empty())
                .map(|line| {
                    if ignore_case {
                        line.to_lowercase()
                    } else {
                        line.to_string()
                    }
                })
                .collect()
        };
        Ok(score(normalize(&expected) == normalize(&produced)))
    }
}

fn notebook_cells(raw: &[u8]) -> std::result::Result<Vec<Value>, String> {
    let value: Value = serde_json::from_slice(raw).map_err(|err| err.to_string())?;
    value
        .get("cells")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| "notebook has no 'cells' array".to_string())
}

fn cell_source(cell: &Value) -> String {
    match cell.get("source") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(lines)) => lines
            .iter()
            .filter_map(Value::as_str)
            .collect::<String>()
            .trim()
            .to_string(),
        _ => String::new(),
    }
}

fn cell_type(cell: &Value) -> &str {
    cell.get("cell_type").and_then(Value::as_str).unwrap_or("")
}

struct CompareNotebookCells;

impl EvalAction for CompareNotebookCells {
    fn evaluate(&self, ctx: &StepContext<'_>, args: &StepArgs) -> Result<f64, EvalFailure> {
        let expected_path = args
            .require_local_path(&["local_expected", "local_path"])
            .map_err(arg_error)?;
        let remote = args
            .require_str(&["vm_result", "remote_path"])
            .map_err(arg_error)?;
        let expected = notebook_cells(&read_expected(ctx, &expected_path)?).map_err(|err| {
            EvalFailure::invalid(format!(
                "expected notebook {} is malformed: {}",
                expected_path.display(),
                err
            ))
        })?;
        let Some(produced) = fetch_produced(ctx, remote)? else {
            return Ok(0.0);
        };
        let Ok(produced) = notebook_cells(&produced) else {
            return Ok(0.0);
        };
        if expected.len() != produced.len() {
            return Ok(0.0);
        }
        let matched = expected.iter().zip(produced.iter()).all(|(e, p)| {
            cell_type(e) == cell_type(p) && cell_source(e) == cell_source(p)
        });
        Ok(score(matched))
    }
}

struct JupyterOutputsCleared;

impl EvalAction for JupyterOutputsCleared {
    fn evaluate(&self, ctx: &StepContext<'_>, args: &StepArgs) -> Result<f64, EvalFailure> {
        let remote = args
            .require_str(&["vm_result", "remote_path"])
            .map_err(arg_error)?;
        let Some(produced) = fetch_produced(ctx, remote)? else {
            return Ok(0.0);
        };
        let Ok(cells) = notebook_cells(&produced) else {
            return Ok(0.0);
        };
        let cleared = cells
            .iter()
            .filter(|cell| cell_type(cell) == "code")
            .all(|cell| {
                cell.get("outputs")
                    .and_then(Value::as_array)
                    .map(|outputs| outputs.is_empty())
                    .unwrap_or(true)
            });
        Ok(score(cleared))
    }
}
