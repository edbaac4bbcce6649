use super::loader::load_config_file;
use super::{
    apply_config, orchestrator_config, parse_duration_value, tool_commands, trafficsim_settings,
    types::{ConfigFile, DurationValue, ToolConfig, TrafficSimConfig},
};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::tempdir;

use crate::args::test_support::parse_test_args;
use crate::error::{AppError, ConfigError, ValidationError};
use crate::probe::{AgentId, ProbeType};
use crate::trafficsim::TrafficSimSettings;

#[test]
fn parse_toml_config_with_sections() -> Result<(), AppError> {
    let dir = tempdir()?;
    let path = dir.path().join("netprobe.toml");
    let content = r#"
agent_id = "agent-a"
probes = "/etc/netprobe/probes.json"
snapshot_poll = "2s"

[trafficsim]
send_interval = "500ms"
packets_per_cycle = 30
loss_threshold_pct = 10

[orchestrator]
interval_unit = 30

[tools.trace]
program = "mtr"
args = ["--json", "-c", "{cycles}", "{target}"]
"#;
    std::fs::write(&path, content)?;

    let config = load_config_file(&path)?;
    if config.agent_id.as_deref() != Some("agent-a") {
        return Err(AppError::config("Unexpected agent_id"));
    }
    let Some(trafficsim) = config.trafficsim.as_ref() else {
        return Err(AppError::config("Expected trafficsim section"));
    };
    if trafficsim.packets_per_cycle != Some(30) {
        return Err(AppError::config("Unexpected packets_per_cycle"));
    }
    let Some(orchestrator) = config.orchestrator.as_ref() else {
        return Err(AppError::config("Expected orchestrator section"));
    };
    if !matches!(orchestrator.interval_unit, Some(DurationValue::Seconds(30))) {
        return Err(AppError::config("Expected bare seconds interval unit"));
    }
    let Some(tools) = config.tools.as_ref() else {
        return Err(AppError::config("Expected tools section"));
    };
    let Some(trace) = tools.get("trace") else {
        return Err(AppError::config("Expected trace tool"));
    };
    if trace.program != "mtr" || trace.args.len() != 4 {
        return Err(AppError::config("Unexpected trace tool"));
    }
    Ok(())
}

#[test]
fn parse_json_config() -> Result<(), AppError> {
    let dir = tempdir()?;
    let path = dir.path().join("netprobe.json");
    let content = r#"{
  "agent_id": "agent-b",
  "results": "results.jsonl",
  "trafficsim": { "loss_timeout": "2s", "idle_timeout": "5m" }
}"#;
    std::fs::write(&path, content)?;

    let config = load_config_file(&path)?;
    if config.results.as_deref() != Some("results.jsonl") {
        return Err(AppError::config("Unexpected results"));
    }
    let settings = trafficsim_settings(config.trafficsim.as_ref())?;
    if settings.loss_timeout != Duration::from_secs(2) {
        return Err(AppError::config("Unexpected loss timeout"));
    }
    if settings.idle_timeout != Duration::from_secs(300) {
        return Err(AppError::config("Unexpected idle timeout"));
    }
    Ok(())
}

#[test]
fn unsupported_extension_is_rejected() -> Result<(), AppError> {
    let dir = tempdir()?;
    let path = dir.path().join("netprobe.yaml");
    std::fs::write(&path, "agent_id: x")?;
    match load_config_file(&path) {
        Err(AppError::Config(ConfigError::UnsupportedExtension { ext })) if ext == "yaml" => Ok(()),
        Err(err) => Err(AppError::config(format!("Unexpected error: {}", err))),
        Ok(_) => Err(AppError::config("Expected yaml to be rejected")),
    }
}

#[test]
fn parse_duration_value_units() -> Result<(), AppError> {
    let cases = [
        ("250ms", Duration::from_millis(250)),
        ("3", Duration::from_secs(3)),
        ("2m", Duration::from_secs(120)),
        ("1h", Duration::from_secs(3600)),
    ];
    for (input, expected) in cases {
        let parsed = parse_duration_value(input)?;
        if parsed != expected {
            return Err(AppError::validation(format!(
                "{} parsed as {:?}",
                input, parsed
            )));
        }
    }
    if !matches!(parse_duration_value("0ms"), Err(ValidationError::DurationZero)) {
        return Err(AppError::validation("Expected zero duration error"));
    }
    if !matches!(
        parse_duration_value("ms"),
        Err(ValidationError::InvalidDurationFormat { .. })
    ) {
        return Err(AppError::validation("Expected format error"));
    }
    Ok(())
}

#[test]
fn cli_values_win_over_config() -> Result<(), AppError> {
    let (mut args, matches) =
        parse_test_args(["netprobe", "--agent-id", "from-cli", "--results", "cli.jsonl"])?;
    let config = ConfigFile {
        agent_id: Some("from-config".to_owned()),
        probes: Some("probes.json".to_owned()),
        results: Some("config.jsonl".to_owned()),
        snapshot_poll: Some(DurationValue::Text("750ms".to_owned())),
        verbose: Some(true),
        ..ConfigFile::default()
    };

    apply_config(&mut args, &matches, &config)?;

    if args.agent_id.as_deref() != Some("from-cli") {
        return Err(AppError::config("CLI agent id should win"));
    }
    if args.results != "cli.jsonl" {
        return Err(AppError::config("CLI results should win"));
    }
    if args.probes.as_deref() != Some("probes.json") {
        return Err(AppError::config("Config probes should apply"));
    }
    if args.snapshot_poll != Duration::from_millis(750) {
        return Err(AppError::config("Config snapshot poll should replace the default"));
    }
    if !args.verbose {
        return Err(AppError::config("Config verbose should apply"));
    }
    Ok(())
}

#[test]
fn trafficsim_defaults_without_section() -> Result<(), AppError> {
    let settings = trafficsim_settings(None)?;
    if settings != TrafficSimSettings::default() {
        return Err(AppError::config("Expected default settings"));
    }
    if settings.packets_per_cycle != 60 || settings.loss_threshold_x100() != 500 {
        return Err(AppError::config("Unexpected default cycle shape"));
    }
    Ok(())
}

#[test]
fn trafficsim_rejects_zero_and_out_of_range() -> Result<(), AppError> {
    let zero_packets = TrafficSimConfig {
        packets_per_cycle: Some(0),
        ..TrafficSimConfig::default()
    };
    if !matches!(
        trafficsim_settings(Some(&zero_packets)),
        Err(ConfigError::FieldMustBePositive {
            field: "trafficsim.packets_per_cycle",
            ..
        })
    ) {
        return Err(AppError::config("Expected zero packets to fail"));
    }

    let zero_interval = TrafficSimConfig {
        send_interval: Some(DurationValue::Seconds(0)),
        ..TrafficSimConfig::default()
    };
    if !matches!(
        trafficsim_settings(Some(&zero_interval)),
        Err(ConfigError::InvalidDuration {
            field: "trafficsim.send_interval",
            ..
        })
    ) {
        return Err(AppError::config("Expected zero interval to fail"));
    }

    let threshold = TrafficSimConfig {
        loss_threshold_pct: Some(101),
        ..TrafficSimConfig::default()
    };
    if !matches!(
        trafficsim_settings(Some(&threshold)),
        Err(ConfigError::LossThresholdOutOfRange { value: 101 })
    ) {
        return Err(AppError::config("Expected threshold above 100 to fail"));
    }
    Ok(())
}

#[test]
fn orchestrator_config_applies_sections() -> Result<(), AppError> {
    let dir = tempdir()?;
    let path = dir.path().join("netprobe.toml");
    std::fs::write(
        &path,
        "[orchestrator]\nteardown_timeout = \"750ms\"\ninterval_unit = \"1s\"\n\n[trafficsim]\nloss_threshold_pct = 0\n",
    )?;
    let config = load_config_file(&path)?;
    let orchestrator = orchestrator_config(AgentId::from("agent-a"), &config)?;
    if orchestrator.local_agent.as_str() != "agent-a" {
        return Err(AppError::config("Unexpected local agent"));
    }
    if orchestrator.teardown_timeout != Duration::from_millis(750) {
        return Err(AppError::config("Unexpected teardown timeout"));
    }
    if orchestrator.interval_unit != Duration::from_secs(1) {
        return Err(AppError::config("Unexpected interval unit"));
    }
    if orchestrator.trafficsim.loss_threshold_pct != 0 {
        return Err(AppError::config("Expected a zero threshold to be accepted"));
    }
    Ok(())
}

#[test]
fn tool_commands_map_kinds() -> Result<(), AppError> {
    let mut tools = BTreeMap::new();
    tools.insert(
        "MTR".to_owned(),
        ToolConfig {
            program: " mtr ".to_owned(),
            args: vec!["{target}".to_owned()],
        },
    );
    tools.insert(
        "speedtest_servers".to_owned(),
        ToolConfig {
            program: "speedtest".to_owned(),
            args: Vec::new(),
        },
    );
    let commands = tool_commands(Some(&tools))?;
    let Some(trace) = commands.get(&ProbeType::Trace) else {
        return Err(AppError::config("Expected trace command"));
    };
    if trace.program != "mtr" {
        return Err(AppError::config("Expected trimmed program"));
    }
    if !commands.contains_key(&ProbeType::SpeedtestServers) {
        return Err(AppError::config("Expected speedtest servers command"));
    }

    let mut unknown = BTreeMap::new();
    unknown.insert(
        "dig".to_owned(),
        ToolConfig {
            program: "dig".to_owned(),
            args: Vec::new(),
        },
    );
    if !matches!(
        tool_commands(Some(&unknown)),
        Err(ConfigError::UnknownToolKind { .. })
    ) {
        return Err(AppError::config("Expected unknown kind to fail"));
    }

    let mut blank = BTreeMap::new();
    blank.insert(
        "ping".to_owned(),
        ToolConfig {
            program: "  ".to_owned(),
            args: Vec::new(),
        },
    );
    if !matches!(
        tool_commands(Some(&blank)),
        Err(ConfigError::ToolProgramEmpty { .. })
    ) {
        return Err(AppError::config("Expected blank program to fail"));
    }
    Ok(())
}
