use anyhow::{anyhow, Result};
use bench_core::BENCH_ORCHESTRATOR_LOG;
use bench_runner::{
    error::CampaignError, load_campaign_config, load_prompt_template, load_task_index, recover,
    recover_with_retry_states, resolve_num_runs, run_repeated, scan_results, write_task_index,
    AgentFactory, Campaign, CampaignConfigFile, CampaignOptions, CampaignReport,
    CommandAgentFactory, RunState, RuntimeSettings, SandboxEndpoints, SandboxHandle, SandboxPool,
    ScriptedAgentFactory, StepRegistry, DEFAULT_PROMPT_TEMPLATE,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SANDBOX_NAME: &str = "sandbox-1";

#[derive(Parser)]
#[command(name = "bench", version, about = "Sandboxed task benchmark orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct CampaignArgs {
    #[arg(long)]
    task_index: PathBuf,
    #[arg(long)]
    tasks_root: PathBuf,
    #[arg(long)]
    results_root: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, requires = "observation_url")]
    gateway_url: Option<String>,
    #[arg(long, requires = "gateway_url")]
    observation_url: Option<String>,
    #[arg(long, default_value = DEFAULT_SANDBOX_NAME)]
    sandbox_name: String,
    /// Program and arguments of an external agent; consumes the remaining words.
    #[arg(long, num_args = 1.., allow_hyphen_values = true, conflicts_with = "agent_script")]
    agent_command: Option<Vec<String>>,
    #[arg(long)]
    agent_script: Option<PathBuf>,
    #[arg(long, requires = "prompt_key")]
    prompt_file: Option<PathBuf>,
    #[arg(long, requires = "prompt_file")]
    prompt_key: Option<String>,
    #[arg(long)]
    task_timeout_secs: Option<u64>,
    #[arg(long)]
    acquire_timeout_secs: Option<u64>,
    #[arg(long)]
    campaign_timeout_secs: Option<u64>,
    #[arg(long)]
    max_agent_steps: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[arg(long)]
        json: bool,
    },
    Repeat {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[arg(long)]
        runs: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    Recover {
        #[arg(long)]
        task_index: PathBuf,
        #[arg(long)]
        results_root: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long = "retry-state")]
        retry_states: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(long)]
        task_index: PathBuf,
        #[arg(long)]
        tasks_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    if let Err(err) = init_tracing(command_log_file(&cli.command).as_deref()) {
        eprintln!("failed to initialize logging: {}", err);
    }
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { campaign, json } => {
            let prepared = PreparedCampaign::from_args(&campaign)?;
            let report = Campaign::new(
                &prepared.options,
                &prepared.pool,
                &prepared.registry,
                prepared.agents.as_ref(),
            )
            .run()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": report_to_json(&report),
                })));
            }
            print_report(&report);
            Ok(None)
        }
        Commands::Repeat {
            campaign,
            runs,
            json,
        } => {
            let runs = resolve_num_runs(runs)?;
            let prepared = PreparedCampaign::from_args(&campaign)?;
            let reports = run_repeated(
                &prepared.options,
                runs,
                &prepared.pool,
                &prepared.registry,
                prepared.agents.as_ref(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "repeat",
                    "runs": reports.iter().map(report_to_json).collect::<Vec<_>>(),
                })));
            }
            for (idx, report) in reports.iter().enumerate() {
                println!("run{}:", idx + 1);
                print_report(report);
            }
            Ok(None)
        }
        Commands::Recover {
            task_index,
            results_root,
            out,
            retry_states,
            json,
        } => {
            let expected = load_task_index(&task_index)?;
            let states = retry_states
                .iter()
                .map(|raw| raw.parse::<RunState>().map_err(|err| anyhow!(err)))
                .collect::<Result<Vec<_>>>()?;
            let missing = if states.is_empty() {
                recover(&expected, &scan_results(&results_root)?)
            } else {
                recover_with_retry_states(&expected, &results_root, &states)?
            };
            write_task_index(&out, &missing)?;
            info!(missing = missing.len(), out = %out.display(), "recovery list written");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "recover",
                    "expected": expected.len(),
                    "missing": missing.len(),
                    "out": out.display().to_string(),
                    "tasks": missing.to_value(),
                })));
            }
            println!("expected: {}", expected.len());
            println!("missing: {}", missing.len());
            println!("recovery_list: {}", out.display());
            Ok(None)
        }
        Commands::Describe {
            task_index,
            tasks_root,
            json,
        } => {
            let index = load_task_index(&task_index)?;
            let registry = StepRegistry::builtin();
            let loader = bench_runner::CatalogLoader::new(&tasks_root, &registry)?;
            let summary = bench_runner::describe_catalog(&index, &loader);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": serde_json::to_value(&summary)?,
                    "config_functions": registry.config_names(),
                    "eval_functions": registry.eval_names(),
                })));
            }
            println!("tasks: {}", summary.total);
            println!("valid: {}", summary.valid);
            for app in &summary.apps {
                println!("  {}: {}/{} valid", app.app, app.valid, app.total);
                for invalid in &app.invalid {
                    println!("    - {}: {}", invalid.task_id, invalid.error);
                }
            }
            Ok(None)
        }
    }
}

/// Everything a campaign needs, assembled from defaults, the YAML file,
/// the environment and finally the command line.
struct PreparedCampaign {
    options: CampaignOptions,
    pool: SandboxPool,
    registry: StepRegistry,
    agents: Box<dyn AgentFactory>,
}

impl PreparedCampaign {
    fn from_args(args: &CampaignArgs) -> Result<Self> {
        let file = match args.config.as_deref() {
            Some(path) => load_campaign_config(path)?,
            None => CampaignConfigFile::default(),
        };
        let settings = resolve_settings(args, &file)?;

        let endpoints = resolve_endpoints(args, &file)?;
        let handles = endpoints
            .iter()
            .map(|endpoints| SandboxHandle::connect_http(
                    endpoints,
                    Duration::from_millis(bench_runner::http::DEFAULT_CONNECT_TIMEOUT_MS),
                ))
            .collect::<Result<Vec<_>>>()?;
        let pool = SandboxPool::with_intervals(
            handles,
            settings.poll_interval,
            bench_runner::sandbox::DEFAULT_PROBE_TIMEOUT,
        );

        let agents = resolve_agents(args, &file, settings.agent_timeout)?;
        let prompt_template = match (&args.prompt_file, &args.prompt_key, &file.prompt) {
            (Some(path), Some(key), _) => load_prompt_template(path, key)?,
            (_, _, Some(prompt)) => load_prompt_template(&prompt.file, &prompt.key)?,
            _ => DEFAULT_PROMPT_TEMPLATE.to_string(),
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        {
            let stop_flag = Arc::clone(&stop_flag);
            if let Err(err) = ctrlc::set_handler(move || {
                if !stop_flag.swap(true, Ordering::SeqCst) {
                    eprintln!("stop requested; finishing the current task");
                }
            }) {
                warn!(error = %err, "failed to install interrupt handler");
            }
        }

        let mut options =
            CampaignOptions::new(&args.task_index, &args.tasks_root, &args.results_root);
        options.settings = settings;
        options.prompt_template = prompt_template;
        options.stop_flag = Some(stop_flag);
        info!(
            sandboxes = endpoints.len(),
            task_timeout = ?options.settings.task_timeout,
            acquire_timeout = ?options.settings.acquire_timeout,
            "campaign configured"
        );

        Ok(Self {
            options,
            pool,
            registry: StepRegistry::builtin(),
            agents,
        })
    }
}

fn resolve_settings(args: &CampaignArgs, file: &CampaignConfigFile) -> Result<RuntimeSettings> {
    let mut settings = RuntimeSettings::default();
    settings.apply_file(file);
    settings.apply_env()?;
    if let Some(secs) = args.task_timeout_secs {
        settings.task_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.acquire_timeout_secs {
        settings.acquire_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.campaign_timeout_secs {
        settings.campaign_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(max) = args.max_agent_steps {
        settings.loop_settings.max_steps_override = Some(max);
    }
    settings.validate()?;
    Ok(settings)
}

fn resolve_endpoints(
    args: &CampaignArgs,
    file: &CampaignConfigFile,
) -> Result<Vec<SandboxEndpoints>> {
    if let (Some(gateway_url), Some(observation_url)) = (&args.gateway_url, &args.observation_url)
    {
        let workdir = file
            .sandboxes
            .first()
            .map(|s| s.workdir.clone())
            .unwrap_or_else(|| bench_core::BENCH_DEFAULT_SANDBOX_WORKDIR.to_string());
        return Ok(vec![SandboxEndpoints {
            name: args.sandbox_name.clone(),
            gateway_url: gateway_url.clone(),
            observation_url: observation_url.clone(),
            workdir,
        }]);
    }
    if file.sandboxes.is_empty() {
        return Err(anyhow!(
            "no sandboxes configured; pass --gateway-url and --observation-url or list sandboxes in --config"
        ));
    }
    Ok(file.sandboxes.clone())
}

fn resolve_agents(
    args: &CampaignArgs,
    file: &CampaignConfigFile,
    timeout: Duration,
) -> Result<Box<dyn AgentFactory>> {
    if let Some(command) = args.agent_command.clone() {
        return Ok(Box::new(CommandAgentFactory::new(command, timeout)?));
    }
    if let Some(script) = args.agent_script.as_deref() {
        return Ok(Box::new(ScriptedAgentFactory::from_file(script)?));
    }
    if let Some(command) = file.agent.command.clone() {
        return Ok(Box::new(CommandAgentFactory::new(command, timeout)?));
    }
    if let Some(script) = file.agent.script.as_deref() {
        return Ok(Box::new(ScriptedAgentFactory::from_file(script)?));
    }
    Err(anyhow!(
        "no agent configured; pass --agent-command or --agent-script, or set agent in --config"
    ))
}

fn command_log_file(command: &Commands) -> Option<PathBuf> {
    match command {
        Commands::Run { campaign, .. } | Commands::Repeat { campaign, .. } => {
            Some(campaign.results_root.join(BENCH_ORCHESTRATOR_LOG))
        }
        Commands::Recover { .. } | Commands::Describe { .. } => None,
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn report_to_json(report: &CampaignReport) -> Value {
    json!({
        "campaign_id": report.campaign_id,
        "results_root": report.results_root.display().to_string(),
        "total_tasks": report.total_tasks,
        "attempted": report.attempted.len(),
        "skipped": report.skipped.len(),
        "state_counts": report.state_counts(),
        "mean_score": report.mean_score(),
        "tasks": serde_json::to_value(&report.attempted).unwrap_or(Value::Null),
    })
}

fn print_report(report: &CampaignReport) {
    println!("campaign: {}", report.campaign_id);
    println!("results_root: {}", report.results_root.display());
    println!("tasks: {}", report.total_tasks);
    println!("attempted: {}", report.attempted.len());
    if !report.skipped.is_empty() {
        println!("skipped:");
        for row in &report.skipped {
            println!("  - {}/{}: {}", row.app, row.task_id, row.reason);
        }
    }
    for (state, count) in report.state_counts() {
        println!("  {}: {}", state, count);
    }
    if let Some(mean) = report.mean_score() {
        println!("mean_score: {:.3}", mean);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<CampaignError>() {
        Some(CampaignError::SandboxUnavailable(_)) => "sandbox_unavailable",
        Some(CampaignError::CampaignTimeout { .. }) => "campaign_timeout",
        Some(CampaignError::Interrupted { .. }) => "interrupted",
        Some(CampaignError::TaskIndex(_)) => "task_index_invalid",
        Some(CampaignError::Persist(_)) => "persist_failed",
        Some(CampaignError::Startup(_)) => "startup_failed",
        Some(CampaignError::RepetitionFailed { .. }) => "repetition_failed",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Repeat { json, .. }
        | Commands::Recover { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments should parse")
    }

    fn campaign_args(cli: Cli) -> CampaignArgs {
        match cli.command {
            Commands::Run { campaign, .. } | Commands::Repeat { campaign, .. } => campaign,
            _ => panic!("expected a campaign command"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn agent_command_consumes_remaining_words() {
        let args = campaign_args(parse(&[
            "bench",
            "run",
            "--task-index",
            "index.json",
            "--tasks-root",
            "tasks",
            "--results-root",
            "results",
            "--max-agent-steps",
            "4",
            "--agent-command",
            "python3",
            "agent.py",
            "--model",
            "small",
        ]));
        assert_eq!(
            args.agent_command,
            Some(vec![
                "python3".to_string(),
                "agent.py".to_string(),
                "--model".to_string(),
                "small".to_string()
            ])
        );
        let settings =
            resolve_settings(&args, &CampaignConfigFile::default()).expect("settings");
        assert_eq!(settings.loop_settings.max_steps_override, Some(4));
    }

    #[test]
    fn endpoints_require_both_urls_or_a_config() {
        assert!(Cli::try_parse_from([
            "bench",
            "run",
            "--task-index",
            "i.json",
            "--tasks-root",
            "t",
            "--results-root",
            "r",
            "--gateway-url",
            "http://127.0.0.1:8888",
        ])
        .is_err());

        let args = campaign_args(parse(&[
            "bench",
            "repeat",
            "--task-index",
            "i.json",
            "--tasks-root",
            "t",
            "--results-root",
            "r",
            "--runs",
            "2",
        ]));
        let err = resolve_endpoints(&args, &CampaignConfigFile::default())
            .expect_err("no sandboxes");
        assert!(err.to_string().contains("--gateway-url"));
        assert!(resolve_agents(&args, &CampaignConfigFile::default(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn campaign_errors_map_to_stable_codes() {
        let err = anyhow::Error::new(CampaignError::Interrupted { attempted: 2 });
        assert_eq!(error_code(&err), "interrupted");
        assert_eq!(error_code(&anyhow!("boom")), "command_failed");
        let payload = json_error("interrupted", err.to_string(), json!({}));
        assert_eq!(payload["ok"], false);
        assert_eq!(payload["error"]["code"], "interrupted");
    }
}
