pub mod agent;
pub mod builtins;
pub mod campaign;
pub mod catalog;
pub mod config;
pub mod control_loop;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod protocol;
pub mod recorder;
pub mod recovery;
pub mod sandbox;
pub mod sink;

#[cfg(test)]
mod testing;

pub use agent::{
    Action, Agent, AgentFactory, CommandAgentFactory, Decision, ScriptedAgent,
    ScriptedAgentFactory, TokenUsage,
};
pub use campaign::{run_repeated, Campaign, CampaignOptions, CampaignReport, TaskSummary};
pub use catalog::{
    describe_catalog, load_task_index, CatalogLoader, CatalogSummary, TaskDescriptor, TaskIndex,
};
pub use config::{
    load_campaign_config, load_prompt_template, render_prompt, resolve_num_runs,
    CampaignConfigFile, RuntimeSettings, DEFAULT_PROMPT_TEMPLATE,
};
pub use control_loop::{step_budget, LoopSettings};
pub use dispatch::{ConfigAction, EvalAction, StepArgs, StepContext, StepRegistry};
pub use error::{CampaignError, RunState};
pub use recorder::{ResultRecorder, RunResult};
pub use recovery::{recover, recover_with_retry_states, scan_results, write_task_index};
pub use sandbox::{SandboxEndpoints, SandboxHandle, SandboxPool, SandboxState};
