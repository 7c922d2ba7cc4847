use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::Path;

pub const TASK_DESCRIPTOR_SCHEMA: &str = "task_descriptor_v1.jsonschema";
pub const TASK_INDEX_SCHEMA: &str = "task_index_v1.jsonschema";
pub const RUN_RESULT_SCHEMA: &str = "run_result_v1.jsonschema";

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

pub fn schema_names() -> Vec<String> {
    SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Dev fallback: allow newly added schema files before this crate is rebuilt.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| anyhow!("schema {} failed to compile: {}", name, e))?;
    Ok(compiled)
}

/// Validates `value` and joins every violation into one message.
pub fn validate_value(schema: &JSONSchema, value: &Value) -> std::result::Result<(), String> {
    match schema.validate(value) {
        Ok(()) => Ok(()),
        Err(errors) => {
            let msgs = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            Err(msgs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn embedded_schemas_are_listed_and_compile() {
        let names = schema_names();
        for name in [TASK_DESCRIPTOR_SCHEMA, TASK_INDEX_SCHEMA, RUN_RESULT_SCHEMA] {
            assert!(names.iter().any(|n| n == name), "missing {}", name);
            compile_schema(name).expect("schema should compile");
        }
    }

    #[test]
    fn every_shipped_schema_compiles() {
        let names = schema_names();
        assert!(!names.is_empty());
        for name in names {
            if let Err(err) = compile_schema(&name) {
                panic!("{} should compile: {}", name, err);
            }
        }
    }

    #[test]
    fn descriptor_schema_requires_config_and_evaluation() {
        let schema = compile_schema(TASK_DESCRIPTOR_SCHEMA).expect("compile");
        let valid = json!({
            "id": "t1",
            "instruction": "do it",
            "config": [{"func": "upload_file_to_vm", "arguments": {"local_path": "a.csv"}}],
            "evaluation": {"func": "compare_csv", "arguments": {}}
        });
        assert!(validate_value(&schema, &valid).is_ok());

        let bare = json!({
            "id": "t1",
            "config": [],
            "evaluation": {"func": "compare_csv"}
        });
        assert!(validate_value(&schema, &bare).is_ok());

        let missing = json!({"id": "t1", "instruction": "do it", "config": []});
        let err = validate_value(&schema, &missing).expect_err("evaluation is required");
        assert!(err.contains("evaluation"), "unexpected error: {}", err);
    }

    #[test]
    fn run_result_schema_rejects_null_score_without_eval_error() {
        let schema = compile_schema(RUN_RESULT_SCHEMA).expect("compile");
        let mut record = json!({
            "id": "t1",
            "app": "jupyter",
            "instruction": "do it",
            "config": [],
            "evaluation": {"func": "compare_csv"},
            "results": {
                "state": "success",
                "score": null,
                "eval_error": null,
                "messages": [],
                "total_tokens": {"input_tokens": 0, "output_tokens": 0, "total_tokens": 0},
                "total_timing": {"start_time": 0.0, "end_time": 1.0, "duration": 1.0}
            }
        });
        assert!(validate_value(&schema, &record).is_err());
        record["results"]["score"] = json!(0.0);
        assert!(validate_value(&schema, &record).is_ok());
    }
}
