use clap::Parser;
use std::time::Duration;

use super::parsers::parse_duration_arg;

const DEFAULT_RESULTS: &str = "-";

#[derive(Debug, Parser, Clone)]
#[clap(
    name = "netprobe",
    version,
    about = "Network-health agent: runs latency, loss, path and throughput probes from a desired-state probe list and streams their results."
)]
pub struct AgentArgs {
    /// Path to config file (TOML/JSON). Defaults to ./netprobe.toml or ./netprobe.json if present.
    #[arg(long, short = 'c')]
    pub config: Option<String>,

    /// Identity of this agent; TrafficSim peers address it by this id
    #[arg(long = "agent-id", env = "NETPROBE_AGENT_ID")]
    pub agent_id: Option<String>,

    /// JSON file holding the full desired probe list
    #[arg(long, short = 'p')]
    pub probes: Option<String>,

    /// Where to write result records as JSON lines ("-" for stdout)
    #[arg(long, short = 'o', default_value = DEFAULT_RESULTS)]
    pub results: String,

    /// How often the probe file is checked for changes (supports ms/s/m/h)
    #[arg(long = "snapshot-poll", default_value = "5s", value_parser = parse_duration_arg)]
    pub snapshot_poll: Duration,

    /// Enable verbose logging (sets log level to debug unless overridden by NETPROBE_LOG/RUST_LOG)
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Disable ANSI colors in log output
    #[arg(long = "no-color")]
    pub no_color: bool,
}
