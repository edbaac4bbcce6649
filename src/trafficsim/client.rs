use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::{ProbeError, ProbeResult, TrafficSimError};
use crate::probe::{AgentId, Probe, ProbeData, ProbeId, ProbePayload, SocketTarget, split_host_port};
use crate::shutdown::{StopListener, StopSignal};
use crate::sinks::ResultSender;
use crate::stats::{AckOutcome, WindowStats, compute, x100_to_f64};

use super::local_addr::discover_local_ip;
use super::protocol::{MAX_DATAGRAM, MessageKind, WireMessage, wall_clock_ms};
use super::report::TrafficSimReport;
use super::settings::TrafficSimSettings;
use super::state::{AckDisposition, CycleState, SessionClock, SessionPhase, lock_cycle};
use super::trigger::TraceTrigger;

const ACK_POLL_INTERVAL: Duration = Duration::from_millis(50);

type SharedCycle = Arc<Mutex<CycleState>>;
type CycleDone = oneshot::Sender<()>;

enum LinkExit {
    Stopped,
    Failed(TrafficSimError),
    Ended,
}

/// Client half of a TrafficSim probe: sends numbered DATA packets to a peer
/// agent and reports loss and RTT once per cycle.
pub struct ClientSession {
    probe_id: ProbeId,
    target: String,
    socket_target: SocketTarget,
    local_agent: AgentId,
    peer_agent: AgentId,
    settings: TrafficSimSettings,
    results: ResultSender,
    trigger: Option<Arc<dyn TraceTrigger>>,
    phase: watch::Sender<SessionPhase>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("probe_id", &self.probe_id)
            .field("target", &self.target)
            .field("peer_agent", &self.peer_agent)
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Builds a session for a TrafficSim client probe. The first target
    /// supplies the `host:port` and the peer agent id.
    ///
    /// # Errors
    ///
    /// Returns an error when the probe has no target, no peer agent, or a
    /// malformed `host:port`.
    pub fn new(
        probe: &Probe,
        local_agent: AgentId,
        settings: TrafficSimSettings,
        results: ResultSender,
    ) -> ProbeResult<Self> {
        let primary = probe
            .primary_target()
            .ok_or_else(|| ProbeError::MissingTarget {
                probe: probe.id.to_string(),
                kind: probe.kind,
            })?;
        let peer_agent = primary
            .agent
            .clone()
            .filter(|agent| !agent.is_empty())
            .ok_or_else(|| ProbeError::MissingPeerAgent {
                probe: probe.id.to_string(),
            })?;
        let socket_target = split_host_port(&primary.target)?;
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Ok(Self {
            probe_id: probe.id.clone(),
            target: primary.target.clone(),
            socket_target,
            local_agent,
            peer_agent,
            settings,
            results,
            trigger: None,
            phase,
        })
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: Arc<dyn TraceTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    #[must_use]
    pub fn phases(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Runs until `stop` fires. Connection failures are retried after the
    /// configured delay; they never end the session.
    pub async fn run(self, mut stop: StopListener) {
        let session = Arc::new(self);
        let clock = SessionClock::start();
        info!(
            "TrafficSim {} starting towards {} (agent {})",
            session.probe_id, session.target, session.peer_agent
        );
        loop {
            if stop.is_stopped() {
                break;
            }
            session.set_phase(SessionPhase::Connecting);
            let socket = match session.connect(&mut stop).await {
                Ok(Some(socket)) => socket,
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        "TrafficSim {} could not connect to {}: {}",
                        session.probe_id, session.target, err
                    );
                    if session.pause(&mut stop).await {
                        continue;
                    }
                    break;
                }
            };
            session.set_phase(SessionPhase::Connected);
            info!(
                "TrafficSim {} connected to {} (agent {})",
                session.probe_id, session.target, session.peer_agent
            );
            match Arc::clone(&session)
                .run_connected(Arc::new(socket), clock, &mut stop)
                .await
            {
                LinkExit::Stopped => break,
                LinkExit::Failed(err) => warn!(
                    "TrafficSim {} lost connection to {}: {}",
                    session.probe_id, session.target, err
                ),
                LinkExit::Ended => warn!(
                    "TrafficSim {} session tasks ended unexpectedly",
                    session.probe_id
                ),
            }
            if !session.pause(&mut stop).await {
                break;
            }
        }
        session.set_phase(SessionPhase::Closing);
        session.set_phase(SessionPhase::Stopped);
        info!("TrafficSim {} stopped", session.probe_id);
    }

    fn set_phase(&self, phase: SessionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            trace!(
                "TrafficSim {} phase {} -> {}",
                self.probe_id, previous, phase
            );
        }
    }

    /// Sleeps for the retry delay. Returns false when stopped meanwhile.
    async fn pause(&self, stop: &mut StopListener) -> bool {
        tokio::select! {
            () = stop.wait() => false,
            () = tokio::time::sleep(self.settings.retry_delay) => true,
        }
    }

    /// Resolves the target, binds a socket on the outbound interface and
    /// exchanges HELLO/ACK. `Ok(None)` means the stop signal fired.
    async fn connect(
        &self,
        stop: &mut StopListener,
    ) -> Result<Option<UdpSocket>, TrafficSimError> {
        let authority = self.socket_target.authority();
        let resolved = tokio::select! {
            () = stop.wait() => return Ok(None),
            resolved = tokio::net::lookup_host(authority.as_str()) => resolved,
        };
        let remote = resolved
            .map_err(|source| TrafficSimError::Resolve {
                target: authority.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| TrafficSimError::NoAddress {
                target: authority.clone(),
            })?;
        let local_ip = discover_local_ip(remote)
            .await
            .map_err(|source| TrafficSimError::Io {
                context: "local address discovery",
                source,
            })?;
        let bind_addr = SocketAddr::new(local_ip, 0);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| TrafficSimError::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        socket
            .connect(remote)
            .await
            .map_err(|source| TrafficSimError::Io {
                context: "connect",
                source,
            })?;

        let hello = WireMessage::hello(&self.local_agent, &self.peer_agent, wall_clock_ms()).encode()?;
        socket
            .send(&hello)
            .await
            .map_err(|source| TrafficSimError::Io {
                context: "send hello",
                source,
            })?;
        debug!(
            "TrafficSim {} sent HELLO to {} from {}",
            self.probe_id, remote, bind_addr
        );

        let mut buffer = vec![0_u8; MAX_DATAGRAM];
        let awaiting_ack = async {
            loop {
                let length =
                    socket
                        .recv(&mut buffer)
                        .await
                        .map_err(|source| TrafficSimError::Io {
                            context: "await hello ack",
                            source,
                        })?;
                if let Some(bytes) = buffer.get(..length)
                    && let Ok(message) = WireMessage::decode(bytes)
                    && message.kind == MessageKind::Ack
                    && message.src == self.peer_agent
                    && message.dst == self.local_agent
                {
                    return Ok::<(), TrafficSimError>(());
                }
            }
        };
        let acked = tokio::select! {
            () = stop.wait() => None,
            acked = tokio::time::timeout(self.settings.hello_timeout, awaiting_ack) => Some(acked),
        };
        match acked {
            None => Ok(None),
            Some(Ok(Ok(()))) => Ok(Some(socket)),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(_elapsed)) => Err(TrafficSimError::HelloTimeout {
                target: authority,
                timeout_ms: u64::try_from(self.settings.hello_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        }
    }

    /// Drives the send, receive and report tasks until the session is stopped
    /// or one of them hits an I/O failure.
    async fn run_connected(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        clock: SessionClock,
        stop: &mut StopListener,
    ) -> LinkExit {
        let state: SharedCycle = Arc::new(Mutex::new(CycleState::default()));
        let (link, link_listener) = StopSignal::new();
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<TrafficSimError>();
        let (cycle_tx, cycle_rx) = mpsc::channel::<CycleDone>(1);

        let tasks = [
            tokio::spawn(Arc::clone(&self).send_loop(
                Arc::clone(&socket),
                Arc::clone(&state),
                clock,
                link_listener.clone(),
                cycle_tx,
                failure_tx.clone(),
            )),
            tokio::spawn(Arc::clone(&self).receive_loop(
                socket,
                Arc::clone(&state),
                clock,
                link_listener.clone(),
                failure_tx,
            )),
            tokio::spawn(Arc::clone(&self).report_loop(state, clock, link_listener, cycle_rx)),
        ];

        let exit = tokio::select! {
            () = stop.wait() => LinkExit::Stopped,
            failure = failure_rx.recv() => failure.map_or(LinkExit::Ended, LinkExit::Failed),
        };
        link.trigger();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(
                    "TrafficSim {} task ended abnormally: {}",
                    self.probe_id, err
                );
            }
        }
        exit
    }

    async fn send_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        state: SharedCycle,
        clock: SessionClock,
        mut stop: StopListener,
        cycles: mpsc::Sender<CycleDone>,
        failures: mpsc::UnboundedSender<TrafficSimError>,
    ) {
        loop {
            self.set_phase(SessionPhase::Sending);
            let mut ticker = tokio::time::interval(self.settings.send_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            for _ in 0..self.settings.packets_per_cycle {
                tokio::select! {
                    () = stop.wait() => return,
                    _ = ticker.tick() => {}
                }
                let sent_wall_ms = wall_clock_ms();
                let seq = lock_cycle(&state).record_send(clock.now_us(), sent_wall_ms);
                let bytes = match WireMessage::data(&self.local_agent, &self.peer_agent, seq, sent_wall_ms)
                    .encode()
                {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("TrafficSim {} failed to encode seq {}: {}", self.probe_id, seq, err);
                        continue;
                    }
                };
                if let Err(source) = socket.send(&bytes).await {
                    report_failure(
                        &failures,
                        TrafficSimError::Io {
                            context: "send data",
                            source,
                        },
                    );
                    return;
                }
            }

            self.set_phase(SessionPhase::Waiting);
            let (done_tx, done_rx) = oneshot::channel();
            if cycles.send(done_tx).await.is_err() {
                return;
            }
            tokio::select! {
                () = stop.wait() => return,
                _ = done_rx => {}
            }
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        state: SharedCycle,
        clock: SessionClock,
        mut stop: StopListener,
        failures: mpsc::UnboundedSender<TrafficSimError>,
    ) {
        let mut buffer = vec![0_u8; MAX_DATAGRAM];
        loop {
            let read = tokio::select! {
                () = stop.wait() => return,
                read = tokio::time::timeout(self.settings.read_timeout, socket.recv(&mut buffer)) => read,
            };
            let length = match read {
                Err(_elapsed) => continue,
                Ok(Err(source)) => {
                    report_failure(
                        &failures,
                        TrafficSimError::Io {
                            context: "receive ack",
                            source,
                        },
                    );
                    return;
                }
                Ok(Ok(length)) => length,
            };
            let Some(bytes) = buffer.get(..length) else {
                continue;
            };
            let message = match WireMessage::decode(bytes) {
                Ok(message) => message,
                Err(err) => {
                    trace!("TrafficSim {} dropping datagram: {}", self.probe_id, err);
                    continue;
                }
            };
            self.apply_ack(&state, clock, &message);
        }
    }

    fn apply_ack(&self, state: &Mutex<CycleState>, clock: SessionClock, message: &WireMessage) {
        if message.kind != MessageKind::Ack
            || message.src != self.peer_agent
            || message.dst != self.local_agent
        {
            trace!(
                "TrafficSim {} ignoring {:?} from {} to {}",
                self.probe_id, message.kind, message.src, message.dst
            );
            return;
        }
        let Some(seq) = message.data.seq else {
            return;
        };
        let disposition = lock_cycle(state).apply_ack(
            seq,
            message.data.sent,
            clock.now_us(),
            self.settings.loss_timeout,
        );
        match disposition {
            AckDisposition::Applied(AckOutcome::Accepted) => {}
            AckDisposition::Applied(AckOutcome::Duplicate) => {
                debug!("TrafficSim {} duplicate ACK for seq {}", self.probe_id, seq);
            }
            AckDisposition::Applied(AckOutcome::LateAfterTimeout) => {
                debug!(
                    "TrafficSim {} late ACK for seq {}; already counted lost",
                    self.probe_id, seq
                );
            }
            AckDisposition::Unknown | AckDisposition::Stale => {
                debug!(
                    "TrafficSim {} ACK for seq {} does not match the current cycle",
                    self.probe_id, seq
                );
            }
        }
    }

    async fn report_loop(
        self: Arc<Self>,
        state: SharedCycle,
        clock: SessionClock,
        mut stop: StopListener,
        mut cycles: mpsc::Receiver<CycleDone>,
    ) {
        loop {
            let done = tokio::select! {
                () = stop.wait() => return,
                done = cycles.recv() => match done {
                    Some(done) => done,
                    None => return,
                },
            };
            if !self.await_trailing_acks(&state, &mut stop).await {
                return;
            }

            self.set_phase(SessionPhase::Reporting);
            let now_us = clock.now_us();
            let (cycle, packets) = lock_cycle(&state).finish_cycle(now_us, self.settings.loss_timeout);
            let stats = compute(&packets, now_us, self.settings.loss_timeout);
            self.publish(cycle, stats);

            if done.send(()).is_err() {
                return;
            }
        }
    }

    /// Waits until every packet of the cycle is acknowledged or the extra
    /// wait runs out. Returns false when stopped meanwhile.
    async fn await_trailing_acks(&self, state: &Mutex<CycleState>, stop: &mut StopListener) -> bool {
        let started = Instant::now();
        while started.elapsed() < self.settings.max_extra_wait {
            if lock_cycle(state).all_acknowledged() {
                return true;
            }
            let remaining = self.settings.max_extra_wait.saturating_sub(started.elapsed());
            tokio::select! {
                () = stop.wait() => return false,
                () = tokio::time::sleep(ACK_POLL_INTERVAL.min(remaining)) => {}
            }
        }
        true
    }

    fn publish(&self, cycle: u64, stats: WindowStats) {
        let loss_pct_x100 = stats.loss_pct_x100;
        info!(
            "TrafficSim {} cycle {}: {} sent, {} received, {} lost, {} pending, {:.2}% loss, avg RTT {}us",
            self.probe_id,
            cycle,
            stats.total_packets,
            stats.received_packets,
            stats.lost_packets,
            stats.pending_packets,
            x100_to_f64(loss_pct_x100),
            stats.avg_rtt_us
        );
        let report = TrafficSimReport::new(&self.target, &self.peer_agent, cycle, stats);
        self.results.emit(ProbeData::new(
            self.probe_id.clone(),
            false,
            ProbePayload::TrafficSim(Box::new(report)),
        ));
        if loss_pct_x100 > self.settings.loss_threshold_x100() {
            self.escalate(loss_pct_x100);
        }
    }

    fn escalate(&self, loss_pct_x100: u64) {
        warn!(
            "TrafficSim {} loss {:.2}% towards {} exceeds {}%",
            self.probe_id,
            x100_to_f64(loss_pct_x100),
            self.target,
            self.settings.loss_threshold_pct
        );
        let Some(trigger) = self.trigger.as_ref() else {
            return;
        };
        if trigger.trigger(&self.probe_id, &self.target) {
            info!(
                "TrafficSim {} requested a trace towards {}",
                self.probe_id, self.socket_target.host
            );
        } else {
            debug!(
                "TrafficSim {} found no trace probe for {}",
                self.probe_id, self.socket_target.host
            );
        }
    }
}

fn report_failure(failures: &mpsc::UnboundedSender<TrafficSimError>, err: TrafficSimError) {
    if let Err(unsent) = failures.send(err) {
        debug!("TrafficSim failure after shutdown: {}", unsent.0);
    }
}
