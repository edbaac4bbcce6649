use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgMatches, CommandFactory, FromArgMatches};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::args::AgentArgs;
use crate::config::{DEFAULT_CONFIG_FILES, apply_config, load_config, orchestrator_config, tool_commands};
use crate::control::FileSnapshotSource;
use crate::error::{AppError, AppResult, ValidationError};
use crate::executors::{CommandTool, StandardExecutors, ToolCommand};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::probe::{AgentId, ProbeType};
use crate::shutdown_handlers::{setup_signal_shutdown_handler, shutdown_channel};
use crate::sinks::{JsonLinesSink, forward_results, result_channel};

/// Snapshots queued between the file poller and the orchestrator.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 4;
/// Bound on draining buffered results after the workers stop.
const RESULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the agent needs after CLI and config are merged.
#[derive(Debug)]
struct AgentPlan {
    probes: PathBuf,
    results: String,
    snapshot_poll: Duration,
    orchestrator: OrchestratorConfig,
    tools: HashMap<ProbeType, ToolCommand>,
}

/// Runs the agent until Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Returns an error for invalid arguments or configuration, or when the
/// result output cannot be opened.
pub fn run() -> AppResult<()> {
    let Some((args, matches)) = parse_args()? else {
        return Ok(());
    };
    let plan = build_plan(args, &matches)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_agent(plan))
}

fn parse_args() -> AppResult<Option<(AgentArgs, ArgMatches)>> {
    let mut cmd = AgentArgs::command();
    let raw_args: Vec<OsString> = std::env::args_os().collect();

    if should_show_help(&raw_args) {
        cmd.print_help()?;
        println!();
        return Ok(None);
    }

    let matches = cmd.get_matches_from(raw_args);
    let args = AgentArgs::from_arg_matches(&matches)?;
    Ok(Some((args, matches)))
}

fn should_show_help(raw_args: &[OsString]) -> bool {
    let treat_as_empty =
        matches!(raw_args, [] | [_]) || matches!(raw_args, [_, second] if second == "--");
    if !treat_as_empty {
        return false;
    }
    if std::env::var_os("NETPROBE_AGENT_ID").is_some() {
        return false;
    }

    !has_default_config()
}

fn has_default_config() -> bool {
    DEFAULT_CONFIG_FILES
        .iter()
        .any(|path| Path::new(path).exists())
}

fn build_plan(mut args: AgentArgs, matches: &ArgMatches) -> AppResult<AgentPlan> {
    let config = load_config(args.config.as_deref())?.unwrap_or_default();
    apply_config(&mut args, matches, &config)?;

    crate::logger::init_logging(args.verbose, args.no_color);

    let agent_id = validate_agent_id(args.agent_id.as_deref())?;
    let Some(probes) = args.probes.take() else {
        tracing::error!("Missing probe snapshot path (set --probes or provide probes in config).");
        return Err(AppError::validation(ValidationError::MissingProbesPath));
    };

    Ok(AgentPlan {
        probes: PathBuf::from(probes),
        results: args.results,
        snapshot_poll: args.snapshot_poll,
        orchestrator: orchestrator_config(agent_id, &config)?,
        tools: tool_commands(config.tools.as_ref())?,
    })
}

fn validate_agent_id(agent_id: Option<&str>) -> AppResult<AgentId> {
    let Some(agent_id) = agent_id else {
        tracing::error!("Missing agent id (set --agent-id or provide agent_id in config).");
        return Err(AppError::validation(ValidationError::MissingAgentId));
    };
    let agent_id = agent_id.trim();
    if agent_id.is_empty() {
        return Err(AppError::validation(ValidationError::EmptyAgentId));
    }
    Ok(AgentId::from(agent_id))
}

async fn run_agent(plan: AgentPlan) -> AppResult<()> {
    let sink = JsonLinesSink::open(Path::new(&plan.results)).await?;
    let (results_tx, results_rx) = result_channel();
    let forwarder = tokio::spawn(forward_results(results_rx, sink));

    let (shutdown_tx, _) = shutdown_channel();
    let orchestrator_shutdown = shutdown_tx.subscribe();
    let source_shutdown = shutdown_tx.subscribe();
    let signal_task = setup_signal_shutdown_handler(&shutdown_tx);

    if plan.tools.is_empty() {
        warn!("No external measurement tools configured; tool-backed probes will report errors");
    }
    let tool = CommandTool::new(plan.tools);
    let executors = Arc::new(StandardExecutors::new(Arc::new(tool)));

    info!(
        "Agent {} starting; results to {}",
        plan.orchestrator.local_agent, plan.results
    );
    let orchestrator = Orchestrator::new(plan.orchestrator, executors, results_tx);

    let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
    let source = FileSnapshotSource::new(plan.probes, plan.snapshot_poll);
    let source_task = tokio::spawn(source.run(snapshot_tx, source_shutdown));

    orchestrator.run(snapshot_rx, orchestrator_shutdown).await;
    drop(orchestrator);

    source_task.await?;
    signal_task.await?;

    match tokio::time::timeout(RESULT_DRAIN_TIMEOUT, forwarder).await {
        Ok(joined) => {
            let delivered = joined?;
            info!("Delivered {} result records", delivered);
        }
        Err(err) => warn!("Result drain did not finish: {}", err),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::test_support::parse_test_args;

    #[test]
    fn help_shown_only_for_bare_invocation() -> AppResult<()> {
        if !should_show_help(&[]) && !has_default_config() {
            return Err(AppError::validation("Expected help for empty args"));
        }
        let with_flag = [OsString::from("netprobe"), OsString::from("--agent-id")];
        if should_show_help(&with_flag) {
            return Err(AppError::validation("Flags should suppress help"));
        }
        Ok(())
    }

    #[test]
    fn agent_id_is_required_and_trimmed() -> AppResult<()> {
        if !matches!(
            validate_agent_id(None),
            Err(AppError::Validation(ValidationError::MissingAgentId))
        ) {
            return Err(AppError::validation("Expected missing agent id"));
        }
        if !matches!(
            validate_agent_id(Some("   ")),
            Err(AppError::Validation(ValidationError::EmptyAgentId))
        ) {
            return Err(AppError::validation("Expected empty agent id"));
        }
        let agent = validate_agent_id(Some(" agent-a "))?;
        if agent.as_str() != "agent-a" {
            return Err(AppError::validation("Expected trimmed agent id"));
        }
        Ok(())
    }

    #[test]
    fn plan_merges_cli_and_config() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("agent.toml");
        std::fs::write(
            &config_path,
            "agent_id = \"agent-a\"\nprobes = \"probes.json\"\n\n[trafficsim]\npackets_per_cycle = 12\n\n[tools.ping]\nprogram = \"ping\"\nargs = [\"-c\", \"{count}\", \"{target}\"]\n",
        )?;
        let config_arg = config_path.to_string_lossy().into_owned();
        let (args, matches) = parse_test_args([
            "netprobe",
            "--config",
            config_arg.as_str(),
            "--results",
            "out.jsonl",
        ])?;

        let plan = build_plan(args, &matches)?;
        if plan.orchestrator.local_agent.as_str() != "agent-a" {
            return Err(AppError::validation("Expected agent id from config"));
        }
        if plan.probes != Path::new("probes.json") {
            return Err(AppError::validation("Expected probes path from config"));
        }
        if plan.results != "out.jsonl" {
            return Err(AppError::validation("Expected CLI results path"));
        }
        if plan.orchestrator.trafficsim.packets_per_cycle != 12 {
            return Err(AppError::validation("Expected configured cycle length"));
        }
        if !plan.tools.contains_key(&ProbeType::Ping) {
            return Err(AppError::validation("Expected ping tool"));
        }
        Ok(())
    }

    #[test]
    fn plan_requires_probes_path() -> AppResult<()> {
        let (args, matches) = parse_test_args([
            "netprobe",
            "--agent-id",
            "agent-a",
            "--config",
            "missing-dir/netprobe.toml",
        ])?;
        match build_plan(args, &matches) {
            Err(AppError::Config(_)) => {}
            Err(err) => return Err(AppError::validation(format!("Unexpected error: {}", err))),
            Ok(_) => return Err(AppError::validation("Expected unreadable config to fail")),
        }

        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("agent.json");
        std::fs::write(&config_path, "{}")?;
        let config_arg = config_path.to_string_lossy().into_owned();
        let (args, matches) = parse_test_args([
            "netprobe",
            "--agent-id",
            "agent-a",
            "--config",
            config_arg.as_str(),
        ])?;
        match build_plan(args, &matches) {
            Err(AppError::Validation(ValidationError::MissingProbesPath)) => Ok(()),
            Err(err) => Err(AppError::validation(format!("Unexpected error: {}", err))),
            Ok(_) => Err(AppError::validation("Expected missing probes path")),
        }
    }
}
