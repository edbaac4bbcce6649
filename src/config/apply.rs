use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use clap::ArgMatches;
use clap::parser::ValueSource;

use crate::args::{AgentArgs, PositiveU64};
use crate::error::ConfigError;
use crate::executors::ToolCommand;
use crate::orchestrator::OrchestratorConfig;
use crate::probe::{AgentId, ProbeType};
use crate::trafficsim::TrafficSimSettings;

use super::types::{ConfigFile, DurationValue, ToolConfig, TrafficSimConfig};

const MAX_LOSS_THRESHOLD_PCT: u64 = 100;

/// Applies configuration values to CLI arguments. Flags given on the
/// command line keep their value.
///
/// # Errors
///
/// Returns an error when a config value is invalid.
pub fn apply_config(
    args: &mut AgentArgs,
    matches: &ArgMatches,
    config: &ConfigFile,
) -> Result<(), ConfigError> {
    if !is_cli(matches, "agent_id")
        && let Some(agent_id) = config.agent_id.clone()
    {
        args.agent_id = Some(agent_id);
    }

    if !is_cli(matches, "probes")
        && let Some(probes) = config.probes.clone()
    {
        args.probes = Some(probes);
    }

    if !is_cli(matches, "results")
        && let Some(results) = config.results.clone()
    {
        args.results = results;
    }

    if !is_cli(matches, "snapshot_poll")
        && let Some(poll) = config.snapshot_poll.as_ref()
    {
        args.snapshot_poll = duration_field(poll, "snapshot_poll")?;
    }

    if !is_cli(matches, "verbose")
        && let Some(verbose) = config.verbose
    {
        args.verbose = verbose;
    }

    if !is_cli(matches, "no_color")
        && let Some(no_color) = config.no_color
    {
        args.no_color = no_color;
    }

    Ok(())
}

/// Builds TrafficSim timing settings, starting from the defaults.
///
/// # Errors
///
/// Returns an error for zero durations or counts and for a loss threshold
/// above 100%.
pub fn trafficsim_settings(
    section: Option<&TrafficSimConfig>,
) -> Result<TrafficSimSettings, ConfigError> {
    let mut settings = TrafficSimSettings::default();
    let Some(section) = section else {
        return Ok(settings);
    };

    if let Some(value) = section.send_interval.as_ref() {
        settings.send_interval = duration_field(value, "trafficsim.send_interval")?;
    }
    if let Some(value) = section.packets_per_cycle {
        let packets = ensure_positive_u64(value, "trafficsim.packets_per_cycle")?;
        settings.packets_per_cycle = u32::try_from(packets.get()).unwrap_or(u32::MAX);
    }
    if let Some(value) = section.loss_timeout.as_ref() {
        settings.loss_timeout = duration_field(value, "trafficsim.loss_timeout")?;
    }
    if let Some(value) = section.max_extra_wait.as_ref() {
        settings.max_extra_wait = duration_field(value, "trafficsim.max_extra_wait")?;
    }
    if let Some(value) = section.loss_threshold_pct {
        if value > MAX_LOSS_THRESHOLD_PCT {
            return Err(ConfigError::LossThresholdOutOfRange { value });
        }
        settings.loss_threshold_pct = value;
    }
    if let Some(value) = section.retry_delay.as_ref() {
        settings.retry_delay = duration_field(value, "trafficsim.retry_delay")?;
    }
    if let Some(value) = section.hello_timeout.as_ref() {
        settings.hello_timeout = duration_field(value, "trafficsim.hello_timeout")?;
    }
    if let Some(value) = section.read_timeout.as_ref() {
        settings.read_timeout = duration_field(value, "trafficsim.read_timeout")?;
    }
    if let Some(value) = section.idle_timeout.as_ref() {
        settings.idle_timeout = duration_field(value, "trafficsim.idle_timeout")?;
    }
    if let Some(value) = section.teardown_timeout.as_ref() {
        settings.teardown_timeout = duration_field(value, "trafficsim.teardown_timeout")?;
    }

    Ok(settings)
}

/// Builds the orchestrator configuration for `local_agent`.
///
/// # Errors
///
/// Returns an error when a TrafficSim or orchestrator value is invalid.
pub fn orchestrator_config(
    local_agent: AgentId,
    config: &ConfigFile,
) -> Result<OrchestratorConfig, ConfigError> {
    let mut orchestrator = OrchestratorConfig::new(local_agent);
    orchestrator.trafficsim = trafficsim_settings(config.trafficsim.as_ref())?;

    if let Some(section) = config.orchestrator.as_ref() {
        if let Some(value) = section.teardown_timeout.as_ref() {
            orchestrator.teardown_timeout = duration_field(value, "orchestrator.teardown_timeout")?;
        }
        if let Some(value) = section.interval_unit.as_ref() {
            orchestrator.interval_unit = duration_field(value, "orchestrator.interval_unit")?;
        }
    }

    Ok(orchestrator)
}

/// Maps `[tools.<kind>]` sections onto external tool commands.
///
/// # Errors
///
/// Returns an error for an unknown kind or a blank program.
pub fn tool_commands(
    tools: Option<&BTreeMap<String, ToolConfig>>,
) -> Result<HashMap<ProbeType, ToolCommand>, ConfigError> {
    let mut commands = HashMap::new();
    let Some(tools) = tools else {
        return Ok(commands);
    };

    for (name, tool) in tools {
        let kind = parse_tool_kind(name)?;
        let program = tool.program.trim();
        if program.is_empty() {
            return Err(ConfigError::ToolProgramEmpty { kind: name.clone() });
        }
        commands.insert(
            kind,
            ToolCommand {
                program: program.to_owned(),
                args: tool.args.clone(),
            },
        );
    }

    Ok(commands)
}

fn parse_tool_kind(name: &str) -> Result<ProbeType, ConfigError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" | "mtr" => Ok(ProbeType::Trace),
        "ping" => Ok(ProbeType::Ping),
        "throughput" | "rperf" => Ok(ProbeType::Throughput),
        "speedtest" => Ok(ProbeType::Speedtest),
        "speedtest_servers" | "speedtest-servers" => Ok(ProbeType::SpeedtestServers),
        _ => Err(ConfigError::UnknownToolKind {
            kind: name.to_owned(),
        }),
    }
}

fn is_cli(matches: &ArgMatches, name: &str) -> bool {
    matches.value_source(name) == Some(ValueSource::CommandLine)
}

fn ensure_positive_u64(value: u64, field: &'static str) -> Result<PositiveU64, ConfigError> {
    PositiveU64::try_from(value).map_err(|err| ConfigError::FieldMustBePositive { field, source: err })
}

fn duration_field(value: &DurationValue, field: &'static str) -> Result<Duration, ConfigError> {
    value
        .to_duration()
        .map_err(|err| ConfigError::InvalidDuration { field, source: err })
}
