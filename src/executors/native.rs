use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::{Cpu, Networks, System};
use tracing::debug;

use crate::error::{ProbeError, ProbeResult};
use crate::probe::{Probe, ProbePayload, split_host_port};
use crate::trafficsim::discover_local_ip;

use super::ProbeExecutor;

/// Network info is refreshed every ten interval units.
const NETWORK_INFO_UNITS: u32 = 10;
/// Route lookup target when the probe names none. No packet is sent.
const DEFAULT_ROUTE_PROBE: &str = "1.1.1.1:53";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub free_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub family: String,
    pub arch: String,
    pub cpus: usize,
    pub cpu_brand: Option<String>,
    pub cpu_frequency_mhz: u64,
    /// Unix seconds.
    pub boot_time: u64,
    pub uptime_secs: u64,
    pub memory: MemoryInfo,
    pub interfaces: Vec<InterfaceInfo>,
    pub agent_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub hostname: String,
    pub local_address: String,
    pub default_gateway: Option<String>,
    pub route_target: String,
}

fn hostname() -> String {
    System::host_name()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

fn interfaces() -> Vec<InterfaceInfo> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<InterfaceInfo> = networks
        .list()
        .iter()
        .map(|(name, data)| InterfaceInfo {
            name: name.clone(),
            mac: data.mac_address().to_string(),
            addresses: data
                .ip_networks()
                .iter()
                .map(|network| format!("{}/{}", network.addr, network.prefix))
                .collect(),
        })
        .collect();
    interfaces.sort_unstable_by(|left, right| left.name.cmp(&right.name));
    interfaces
}

fn host_facts() -> SystemInfo {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_all();
    let first_cpu = system.cpus().first();
    SystemInfo {
        hostname: hostname(),
        os: System::name().unwrap_or_else(|| std::env::consts::OS.to_owned()),
        os_version: System::long_os_version(),
        kernel_version: System::kernel_version(),
        family: std::env::consts::FAMILY.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        cpus: system.cpus().len().max(1),
        cpu_brand: first_cpu
            .map(|cpu| cpu.brand().trim().to_owned())
            .filter(|brand| !brand.is_empty()),
        cpu_frequency_mhz: first_cpu.map_or(0, Cpu::frequency),
        boot_time: System::boot_time(),
        uptime_secs: System::uptime(),
        memory: MemoryInfo {
            total_bytes: system.total_memory(),
            used_bytes: system.used_memory(),
            available_bytes: system.available_memory(),
            free_bytes: system.free_memory(),
            swap_total_bytes: system.total_swap(),
            swap_used_bytes: system.used_swap(),
        },
        interfaces: interfaces(),
        agent_version: env!("CARGO_PKG_VERSION").to_owned(),
    }
}

/// Address of the default gateway, when the host has a default route.
fn default_gateway() -> Option<String> {
    match netdev::get_default_gateway() {
        Ok(gateway) => gateway
            .ipv4
            .first()
            .map(ToString::to_string)
            .or_else(|| gateway.ipv6.first().map(ToString::to_string)),
        Err(err) => {
            debug!("No default gateway: {}", err);
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInfoExecutor;

impl SystemInfoExecutor {
    /// Gathers host facts off the async workers.
    ///
    /// # Errors
    ///
    /// Returns an error when the collection task panics or is cancelled.
    pub async fn collect() -> ProbeResult<SystemInfo> {
        tokio::task::spawn_blocking(host_facts)
            .await
            .map_err(|source| ProbeError::HostFacts { source })
    }
}

#[async_trait]
impl ProbeExecutor for SystemInfoExecutor {
    async fn tick(&mut self, _probe: &Probe, _triggered: bool) -> ProbeResult<Option<ProbePayload>> {
        Ok(Some(ProbePayload::SystemInfo(Self::collect().await?)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkInfoExecutor;

impl NetworkInfoExecutor {
    /// Reports the interface address used to reach `route_target` and the
    /// default gateway.
    ///
    /// # Errors
    ///
    /// Returns an error when the target is malformed or unroutable.
    pub async fn collect(route_target: &str) -> ProbeResult<NetworkInfo> {
        let parsed = split_host_port(route_target)?;
        let remote = tokio::net::lookup_host(parsed.authority())
            .await
            .map_err(|source| ProbeError::LocalAddress { source })?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| ProbeError::InvalidTarget {
                target: route_target.to_owned(),
                reason: "no IPv4 address",
            })?;
        let local = discover_local_ip(remote)
            .await
            .map_err(|source| ProbeError::LocalAddress { source })?;
        let (hostname, default_gateway) =
            tokio::task::spawn_blocking(|| (hostname(), default_gateway()))
                .await
                .map_err(|source| ProbeError::HostFacts { source })?;
        Ok(NetworkInfo {
            hostname,
            local_address: local.to_string(),
            default_gateway,
            route_target: route_target.to_owned(),
        })
    }
}

#[async_trait]
impl ProbeExecutor for NetworkInfoExecutor {
    async fn tick(&mut self, probe: &Probe, _triggered: bool) -> ProbeResult<Option<ProbePayload>> {
        let route_target = probe
            .primary_target()
            .map(|target| target.target.as_str())
            .filter(|target| !target.trim().is_empty())
            .unwrap_or(DEFAULT_ROUTE_PROBE);
        let info = Self::collect(route_target).await?;
        Ok(Some(ProbePayload::NetworkInfo(info)))
    }

    fn cadence(&self, _probe: &Probe, unit: Duration) -> Duration {
        unit.saturating_mul(NETWORK_INFO_UNITS)
    }
}
