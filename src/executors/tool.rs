use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProbeError, ProbeResult};
use crate::probe::ProbeType;

/// One measurement requested from an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementRequest {
    pub kind: ProbeType,
    pub target: Option<String>,
    pub count: u64,
    pub duration: u64,
    pub cycles: u32,
    pub triggered: bool,
}

/// Port to whatever actually performs trace, ping, throughput and speed
/// measurements.
#[async_trait]
pub trait MeasurementTool: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the tool is missing, fails to start, or exits
    /// unsuccessfully.
    async fn measure(&self, request: &MeasurementRequest) -> ProbeResult<serde_json::Value>;
}

/// Program and argument template for one probe kind. Arguments may contain
/// `{target}`, `{count}`, `{duration}` and `{cycles}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    fn render_args(&self, request: &MeasurementRequest) -> Vec<String> {
        let target = request.target.as_deref().unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{target}", target)
                    .replace("{count}", &request.count.to_string())
                    .replace("{duration}", &request.duration.to_string())
                    .replace("{cycles}", &request.cycles.to_string())
            })
            .collect()
    }
}

/// Runs configured external programs. The child is killed when the
/// measurement future is dropped.
#[derive(Debug, Clone, Default)]
pub struct CommandTool {
    commands: HashMap<ProbeType, ToolCommand>,
}

impl CommandTool {
    #[must_use]
    pub const fn new(commands: HashMap<ProbeType, ToolCommand>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl MeasurementTool for CommandTool {
    async fn measure(&self, request: &MeasurementRequest) -> ProbeResult<serde_json::Value> {
        let command = self
            .commands
            .get(&request.kind)
            .ok_or_else(|| ProbeError::ToolNotConfigured {
                kind: request.kind.to_string(),
            })?;
        let args = command.render_args(request);
        debug!("Running {} {:?}", command.program, args);

        let output = Command::new(&command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProbeError::ToolLaunch {
                program: command.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ProbeError::ToolExit {
                program: command.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        let stdout =
            String::from_utf8(output.stdout).map_err(|source| ProbeError::ToolOutput { source })?;
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_owned())))
    }
}
