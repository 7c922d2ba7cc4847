use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bench_core::{atomic_write_bytes, BENCH_FACTS_DIR};

use crate::error::RunState;

const FACTS_ATTEMPTS_FILE: &str = "attempts.jsonl";
const FACTS_SKIPPED_FILE: &str = "skipped.jsonl";
const FACTS_CAMPAIGN_MANIFEST_FILE: &str = "campaign_manifest.json";

pub const CAMPAIGN_MANIFEST_SCHEMA_V1: &str = "campaign_manifest_v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignManifestRecord {
    pub schema_version: String,
    pub campaign_id: String,
    pub created_at: String,
    pub task_index_path: String,
    pub task_index_digest: String,
    pub results_root: String,
    pub total_tasks: usize,
    pub sandboxes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub campaign_id: String,
    pub app: String,
    pub task_id: String,
    pub state: RunState,
    pub score: Option<f64>,
    pub eval_error: Option<String>,
    pub steps: usize,
    pub duration_secs: f64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub summary_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub campaign_id: String,
    pub app: String,
    pub task_id: String,
    pub reason: String,
}

/// Append-only ledger of a campaign, next to the per-task summaries.
pub trait CampaignSink {
    fn write_manifest(&mut self, manifest: &CampaignManifestRecord) -> Result<()>;
    fn append_attempt(&mut self, row: &AttemptRecord) -> Result<()>;
    fn append_skipped(&mut self, row: &SkippedRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlCampaignSink {
    manifest_path: PathBuf,
    attempts_writer: BufWriter<File>,
    skipped_writer: BufWriter<File>,
}

impl JsonlCampaignSink {
    pub fn new(results_root: &Path) -> Result<Self> {
        let facts_dir = results_root.join(BENCH_FACTS_DIR);
        fs::create_dir_all(&facts_dir)?;

        Ok(Self {
            manifest_path: facts_dir.join(FACTS_CAMPAIGN_MANIFEST_FILE),
            attempts_writer: open_append(facts_dir.join(FACTS_ATTEMPTS_FILE))?,
            skipped_writer: open_append(facts_dir.join(FACTS_SKIPPED_FILE))?,
        })
    }
}

impl CampaignSink for JsonlCampaignSink {
    fn write_manifest(&mut self, manifest: &CampaignManifestRecord) -> Result<()> {
        atomic_write_bytes(&self.manifest_path, &serde_json::to_vec_pretty(manifest)?)
    }

    // Rows are flushed one by one so an abort never loses a recorded attempt.
    fn append_attempt(&mut self, row: &AttemptRecord) -> Result<()> {
        append_row(&mut self.attempts_writer, row)?;
        self.attempts_writer.flush()?;
        Ok(())
    }

    fn append_skipped(&mut self, row: &SkippedRecord) -> Result<()> {
        append_row(&mut self.skipped_writer, row)?;
        self.skipped_writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.attempts_writer.flush()?;
        self.skipped_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
