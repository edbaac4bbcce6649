use super::reconcile::{Change, classify};
use super::*;
use crate::error::ProbeError;
use crate::executors::{ExecutorFactory, ProbeExecutor};
use crate::probe::{AgentId, Probe, ProbeConfig, ProbeId, ProbePayload, ProbeTarget, ProbeType};
use crate::sinks::result_channel;
use crate::trafficsim::{TraceTrigger, TrafficSimSettings};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const SETTLE_LIMIT: Duration = Duration::from_secs(3);

fn run_async_test<F>(future: F) -> Result<(), ProbeError>
where
    F: Future<Output = Result<(), ProbeError>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|source| ProbeError::LocalAddress { source })?;
    runtime.block_on(future)
}

struct CountingExecutor {
    ticks: Arc<AtomicUsize>,
}

#[async_trait]
impl ProbeExecutor for CountingExecutor {
    async fn tick(&mut self, probe: &Probe, triggered: bool) -> Result<Option<ProbePayload>, ProbeError> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(Some(ProbePayload::Measurement(serde_json::json!({
            "probe": probe.id.as_str(),
            "tick": tick,
            "triggered": triggered,
        }))))
    }
}

#[derive(Default)]
struct CountingFactory {
    ticks: Arc<AtomicUsize>,
}

impl ExecutorFactory for CountingFactory {
    fn create(&self, kind: ProbeType) -> Option<Box<dyn ProbeExecutor>> {
        match kind {
            ProbeType::TrafficSim => None,
            ProbeType::Trace
            | ProbeType::Throughput
            | ProbeType::Ping
            | ProbeType::Speedtest
            | ProbeType::SpeedtestServers
            | ProbeType::NetworkInfo
            | ProbeType::SystemInfo => Some(Box::new(CountingExecutor {
                ticks: Arc::clone(&self.ticks),
            })),
        }
    }
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        local_agent: AgentId::from("agent-local"),
        trafficsim: TrafficSimSettings {
            send_interval: Duration::from_millis(20),
            packets_per_cycle: 10,
            loss_timeout: Duration::from_millis(150),
            max_extra_wait: Duration::from_millis(300),
            retry_delay: Duration::from_millis(100),
            hello_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(20),
            teardown_timeout: Duration::from_millis(500),
            ..TrafficSimSettings::default()
        },
        teardown_timeout: Duration::from_millis(500),
        interval_unit: Duration::from_millis(20),
    }
}

fn orchestrator() -> (Orchestrator, Arc<CountingFactory>, crate::sinks::ResultReceiver) {
    let factory = Arc::new(CountingFactory::default());
    let (results, rx) = result_channel();
    let orchestrator = Orchestrator::new(
        test_config(),
        Arc::clone(&factory) as Arc<dyn ExecutorFactory>,
        results,
    );
    (orchestrator, factory, rx)
}

fn target(address: &str, agent: Option<&str>) -> ProbeTarget {
    ProbeTarget {
        target: address.to_owned(),
        agent: agent.map(AgentId::from),
        group: None,
    }
}

fn probe(id: &str, kind: ProbeType, targets: Vec<ProbeTarget>) -> Probe {
    Probe {
        id: ProbeId::from(id),
        kind,
        agent: None,
        config: ProbeConfig {
            target: targets,
            ..ProbeConfig::default()
        },
    }
}

fn server_probe(id: &str, listen: &str, peers: &[&str]) -> Probe {
    let mut targets = vec![target(listen, None)];
    targets.extend(peers.iter().map(|peer| target("", Some(peer))));
    let mut server = probe(id, ProbeType::TrafficSim, targets);
    server.config.server = true;
    server
}

fn ids(names: &[&str]) -> Vec<ProbeId> {
    names.iter().map(|name| ProbeId::from(*name)).collect()
}

fn free_port() -> Result<u16, ProbeError> {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").map_err(|source| ProbeError::LocalAddress { source })?;
    Ok(socket
        .local_addr()
        .map_err(|source| ProbeError::LocalAddress { source })?
        .port())
}

async fn wait_until<F>(mut condition: F, what: &'static str) -> Result<(), ProbeError>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now()
        .checked_add(SETTLE_LIMIT)
        .ok_or_else(|| ProbeError::from("Deadline overflow"))?;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err(ProbeError::from(what));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[test]
fn classify_separates_restarts_from_in_place_updates() -> Result<(), ProbeError> {
    let client = probe("sim", ProbeType::TrafficSim, vec![target("10.0.0.1:1000", Some("b"))]);
    let mut moved = client.clone();
    moved.config.target = vec![target("10.0.0.2:1000", Some("b"))];
    let mut repeered = client.clone();
    repeered.config.target = vec![target("10.0.0.1:1000", Some("c"))];
    let mut retimed = client.clone();
    retimed.config.interval = 9;
    let mut retyped = client.clone();
    retyped.kind = ProbeType::Ping;

    let server = server_probe("srv", "0.0.0.0:1000", &["a"]);
    let widened = server_probe("srv", "0.0.0.0:1000", &["a", "b"]);
    let mut demoted = server.clone();
    demoted.config.server = false;

    let cases = [
        (&client, &client, Change::Unchanged),
        (&client, &moved, Change::Restart),
        (&client, &repeered, Change::Restart),
        (&client, &retimed, Change::Definition),
        (&client, &retyped, Change::Restart),
        (&server, &widened, Change::AllowList),
        (&server, &demoted, Change::Restart),
    ];
    for (current, next, expected) in cases {
        let change = classify(current, next);
        if change != expected {
            return Err(ProbeError::from(format!(
                "Expected {:?} for {:?} -> {:?}, got {:?}",
                expected, current.config, next.config, change
            )));
        }
    }
    Ok(())
}

#[test]
fn registry_matches_desired_state_after_each_pass() -> Result<(), ProbeError> {
    run_async_test(async {
        let (orchestrator, _, _rx) = orchestrator();
        let ping = probe("ping", ProbeType::Ping, vec![target("10.1.1.1", None)]);
        let info = probe("info", ProbeType::SystemInfo, Vec::new());
        let trace = probe("trace", ProbeType::Trace, vec![target("10.1.1.2", None)]);

        let first = orchestrator
            .reconcile(vec![ping.clone(), info.clone()])
            .await;
        if first.started != ids(&["ping", "info"]) {
            return Err(ProbeError::from(format!("Unexpected first pass: {:?}", first)));
        }
        if orchestrator.registry().active_ids() != ids(&["info", "ping"]) {
            return Err(ProbeError::from("Registry should hold both probes"));
        }

        let mut slower = ping.clone();
        slower.config.interval = 5;
        let second = orchestrator
            .reconcile(vec![slower.clone(), trace.clone()])
            .await;
        if second.updated != ids(&["ping"]) || second.started != ids(&["trace"]) || second.removed != ids(&["info"]) {
            return Err(ProbeError::from(format!("Unexpected second pass: {:?}", second)));
        }
        if orchestrator.registry().active_ids() != ids(&["ping", "trace"]) {
            return Err(ProbeError::from("Active ids should follow the snapshot"));
        }
        if orchestrator.registry().probe(&ProbeId::from("ping")) != Some(slower.clone()) {
            return Err(ProbeError::from("Definition should be replaced in place"));
        }

        let registry = Arc::clone(orchestrator.registry());
        wait_until(
            || !registry.contains(&ProbeId::from("info")),
            "Removed worker should delete its own entry",
        )
        .await?;

        let unchanged = orchestrator.reconcile(vec![slower, trace]).await;
        if !unchanged.is_empty() {
            return Err(ProbeError::from(format!("Identical snapshot should be a no-op: {:?}", unchanged)));
        }
        orchestrator.shutdown_all().await;
        if !orchestrator.registry().is_empty() {
            return Err(ProbeError::from("Shutdown should empty the registry"));
        }
        Ok(())
    })
}

#[test]
fn invalid_and_duplicate_probes_are_not_started() -> Result<(), ProbeError> {
    run_async_test(async {
        let (orchestrator, _, _rx) = orchestrator();
        let no_target = probe("ping", ProbeType::Ping, Vec::new());
        let no_peer = probe("sim", ProbeType::TrafficSim, vec![target("10.0.0.1:1000", None)]);
        let bad_port = probe("sim-port", ProbeType::TrafficSim, vec![target("10.0.0.1", Some("b"))]);
        let first = probe("dup", ProbeType::SystemInfo, Vec::new());
        let mut second = first.clone();
        second.config.interval = 7;

        let summary = orchestrator
            .reconcile(vec![no_target, no_peer, bad_port, first.clone(), second])
            .await;
        if summary.rejected != ids(&["ping", "sim", "sim-port"]) || summary.started != ids(&["dup"]) {
            return Err(ProbeError::from(format!("Unexpected summary: {:?}", summary)));
        }
        if orchestrator.registry().active_ids() != ids(&["dup"]) {
            return Err(ProbeError::from("Rejected probes must stay absent"));
        }
        if orchestrator.registry().probe(&ProbeId::from("dup")) != Some(first) {
            return Err(ProbeError::from("First duplicate should win"));
        }
        orchestrator.shutdown_all().await;
        Ok(())
    })
}

#[test]
fn workers_emit_and_reread_their_definition() -> Result<(), ProbeError> {
    run_async_test(async {
        let (orchestrator, factory, mut rx) = orchestrator();
        let ping = probe("ping", ProbeType::Ping, vec![target("10.1.1.1", None)]);
        orchestrator.reconcile(vec![ping]).await;

        let record = tokio::time::timeout(SETTLE_LIMIT, rx.recv())
            .await
            .map_err(|_elapsed| ProbeError::from("No result emitted"))?
            .ok_or_else(|| ProbeError::from("Result channel closed"))?;
        if record.probe_id.as_str() != "ping" || record.triggered {
            return Err(ProbeError::from(format!("Unexpected record: {:?}", record)));
        }
        let ticks = Arc::clone(&factory.ticks);
        wait_until(|| ticks.load(Ordering::SeqCst) >= 3, "Worker should keep ticking").await?;

        orchestrator.reconcile(Vec::new()).await;
        let registry = Arc::clone(orchestrator.registry());
        wait_until(|| registry.is_empty(), "Worker should exit after removal").await?;
        let settled = factory.ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if factory.ticks.load(Ordering::SeqCst) != settled {
            return Err(ProbeError::from("Removed worker kept measuring"));
        }
        Ok(())
    })
}

#[test]
fn client_endpoint_change_restarts_exactly_once() -> Result<(), ProbeError> {
    run_async_test(async {
        let (orchestrator, _, _rx) = orchestrator();
        let id = ProbeId::from("sim");
        let original = probe("sim", ProbeType::TrafficSim, vec![target("127.0.0.1:9", Some("peer"))]);
        orchestrator.reconcile(vec![original.clone()]).await;
        let before = orchestrator
            .registry()
            .generation(&id)
            .ok_or_else(|| ProbeError::from("Client should be registered"))?;

        let mut retimed = original.clone();
        retimed.config.interval = 3;
        let update = orchestrator.reconcile(vec![retimed]).await;
        if update.updated != vec![id.clone()] || orchestrator.registry().generation(&id) != Some(before) {
            return Err(ProbeError::from(format!("Non-endpoint change must not restart: {:?}", update)));
        }

        let mut moved = original;
        moved.config.target = vec![target("127.0.0.2:9", Some("peer"))];
        let restart = orchestrator.reconcile(vec![moved.clone()]).await;
        if restart.restarted != vec![id.clone()] || !restart.started.is_empty() || !restart.removed.is_empty() {
            return Err(ProbeError::from(format!("Unexpected restart summary: {:?}", restart)));
        }
        let after = orchestrator
            .registry()
            .generation(&id)
            .ok_or_else(|| ProbeError::from("Restarted client should be registered"))?;
        if after == before || orchestrator.registry().len() != 1 {
            return Err(ProbeError::from("Restart should leave exactly one newer entry"));
        }
        if orchestrator.registry().probe(&id) != Some(moved) {
            return Err(ProbeError::from("Restarted entry should hold the new definition"));
        }
        orchestrator.shutdown_all().await;
        Ok(())
    })
}

#[test]
fn server_listeners_follow_allow_list_and_port_changes() -> Result<(), ProbeError> {
    run_async_test(async {
        let (orchestrator, _, _rx) = orchestrator();
        let id = ProbeId::from("srv");
        let first_port = free_port()?;
        let listen = format!("127.0.0.1:{}", first_port);

        orchestrator
            .reconcile(vec![server_probe("srv", &listen, &["a"])])
            .await;
        let generation = orchestrator.registry().generation(&id);
        if orchestrator.listeners().active_ports().await != vec![first_port] {
            return Err(ProbeError::from("Server should bind its port"));
        }

        let widened = orchestrator
            .reconcile(vec![server_probe("srv", &listen, &["a", "b"])])
            .await;
        let expected: BTreeSet<AgentId> = [AgentId::from("a"), AgentId::from("b")].into_iter().collect();
        if widened.updated != vec![id.clone()]
            || orchestrator.registry().generation(&id) != generation
            || orchestrator.listeners().allowed_agents(&id).await != Some(expected)
        {
            return Err(ProbeError::from(format!("Allow-list should update in place: {:?}", widened)));
        }

        let second_port = free_port()?;
        let moved = format!("127.0.0.1:{}", second_port);
        let restart = orchestrator
            .reconcile(vec![server_probe("srv", &moved, &["a"])])
            .await;
        if restart.restarted != vec![id.clone()] {
            return Err(ProbeError::from(format!("Port change should restart: {:?}", restart)));
        }
        if orchestrator.listeners().active_ports().await != vec![second_port] {
            return Err(ProbeError::from("Old port should be released, new port bound"));
        }

        let removed = orchestrator.reconcile(Vec::new()).await;
        if removed.removed != vec![id.clone()] || orchestrator.registry().contains(&id) {
            return Err(ProbeError::from("Server removal should be awaited"));
        }
        if !orchestrator.listeners().active_ports().await.is_empty() {
            return Err(ProbeError::from("No listener should survive removal"));
        }
        Ok(())
    })
}

#[test]
fn find_probe_ignores_ports_and_removed_entries() -> Result<(), ProbeError> {
    run_async_test(async {
        let (orchestrator, _, _rx) = orchestrator();
        let trace = probe("trace", ProbeType::Trace, vec![target("192.0.2.7:33434", None)]);
        orchestrator.reconcile(vec![trace]).await;
        let registry = orchestrator.registry();
        let found = registry
            .find_probe(ProbeType::Trace, "192.0.2.7:5000")
            .ok_or_else(|| ProbeError::from("Trace should match on host"))?;
        if found.id.as_str() != "trace" {
            return Err(ProbeError::from("Wrong probe matched"));
        }
        if registry.find_probe(ProbeType::Ping, "192.0.2.7").is_some()
            || registry.find_probe(ProbeType::Trace, "192.0.2.8").is_some()
        {
            return Err(ProbeError::from("Type and host must both match"));
        }
        orchestrator.reconcile(Vec::new()).await;
        if registry.find_probe(ProbeType::Trace, "192.0.2.7").is_some() {
            return Err(ProbeError::from("Removed probe should not be found"));
        }
        orchestrator.shutdown_all().await;
        Ok(())
    })
}

const SLOW_TRACE: Duration = Duration::from_millis(800);

/// Triggered ticks take `SLOW_TRACE`; scheduled ones answer at once.
struct SlowTraceExecutor {
    finished: Arc<AtomicUsize>,
}

#[async_trait]
impl ProbeExecutor for SlowTraceExecutor {
    async fn tick(&mut self, probe: &Probe, triggered: bool) -> Result<Option<ProbePayload>, ProbeError> {
        if triggered {
            tokio::time::sleep(SLOW_TRACE).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Some(ProbePayload::Measurement(serde_json::json!({
            "probe": probe.id.as_str(),
            "triggered": triggered,
        }))))
    }
}

#[derive(Default)]
struct SlowTraceFactory {
    finished: Arc<AtomicUsize>,
}

impl ExecutorFactory for SlowTraceFactory {
    fn create(&self, kind: ProbeType) -> Option<Box<dyn ProbeExecutor>> {
        match kind {
            ProbeType::Trace => Some(Box::new(SlowTraceExecutor {
                finished: Arc::clone(&self.finished),
            })),
            ProbeType::TrafficSim
            | ProbeType::Throughput
            | ProbeType::Ping
            | ProbeType::Speedtest
            | ProbeType::SpeedtestServers
            | ProbeType::NetworkInfo
            | ProbeType::SystemInfo => None,
        }
    }
}

/// Starts a trace probe and one slow triggered run against it.
async fn orchestrator_with_triggered_trace()
-> Result<(Orchestrator, Arc<SlowTraceFactory>, crate::sinks::ResultReceiver), ProbeError> {
    let factory = Arc::new(SlowTraceFactory::default());
    let (results, rx) = result_channel();
    let mut config = test_config();
    config.interval_unit = Duration::from_secs(3600);
    let orchestrator = Orchestrator::new(
        config,
        Arc::clone(&factory) as Arc<dyn ExecutorFactory>,
        results,
    );
    let trace = probe("trace", ProbeType::Trace, vec![target("192.0.2.9", None)]);
    orchestrator.reconcile(vec![trace]).await;
    if !orchestrator.trigger.trigger(&ProbeId::from("sim"), "192.0.2.9:4000") {
        return Err(ProbeError::from("Trace probe should accept a trigger"));
    }
    if orchestrator.trigger.in_flight() != 1 {
        return Err(ProbeError::from("Triggered run should be tracked"));
    }
    Ok((orchestrator, factory, rx))
}

/// Fails if a triggered record shows up before `SLOW_TRACE` plus slack.
async fn expect_no_triggered_record(rx: &mut crate::sinks::ResultReceiver) -> Result<(), ProbeError> {
    let deadline = tokio::time::Instant::now()
        .checked_add(SLOW_TRACE.saturating_mul(2))
        .ok_or_else(|| ProbeError::from("Deadline overflow"))?;
    while let Ok(Some(record)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if record.triggered {
            return Err(ProbeError::from(format!(
                "Cancelled trace still reported: {:?}",
                record
            )));
        }
    }
    Ok(())
}

#[test]
fn shutdown_all_cancels_triggered_traces() -> Result<(), ProbeError> {
    run_async_test(async {
        let (orchestrator, factory, mut rx) = orchestrator_with_triggered_trace().await?;

        orchestrator.shutdown_all().await;
        if !orchestrator.registry().is_empty() || orchestrator.trigger.in_flight() != 0 {
            return Err(ProbeError::from("Shutdown should leave nothing running"));
        }
        expect_no_triggered_record(&mut rx).await?;
        if factory.finished.load(Ordering::SeqCst) != 0 {
            return Err(ProbeError::from("Triggered trace ran to completion"));
        }
        if orchestrator.trigger.trigger(&ProbeId::from("sim"), "192.0.2.9") {
            return Err(ProbeError::from("No trigger should start after shutdown"));
        }
        Ok(())
    })
}

#[test]
fn removing_trace_probe_cancels_its_triggered_run() -> Result<(), ProbeError> {
    run_async_test(async {
        let (orchestrator, factory, mut rx) = orchestrator_with_triggered_trace().await?;

        orchestrator.reconcile(Vec::new()).await;
        let trigger = Arc::clone(&orchestrator.trigger);
        wait_until(|| trigger.in_flight() == 0, "Triggered run should stop with its probe").await?;
        expect_no_triggered_record(&mut rx).await?;
        if factory.finished.load(Ordering::SeqCst) != 0 {
            return Err(ProbeError::from("Triggered trace outlived its probe"));
        }
        orchestrator.shutdown_all().await;
        Ok(())
    })
}
