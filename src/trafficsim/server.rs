use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::probe::AgentId;
use crate::shutdown::StopListener;

use super::listeners::AllowList;
use super::protocol::{MAX_DATAGRAM, MessageKind, WireMessage, wall_clock_ms};

const MIN_REAP_PERIOD: Duration = Duration::from_millis(100);

/// Listener-side view of one client agent.
#[derive(Debug, Clone)]
pub(crate) struct PeerConnection {
    addr: SocketAddr,
    last_seen: Instant,
    expected_seq: u32,
}

impl PeerConnection {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            last_seen: Instant::now(),
            expected_seq: 1,
        }
    }

    fn observe(&mut self, agent: &AgentId, seq: u32, from: SocketAddr) {
        self.last_seen = Instant::now();
        if self.addr != from {
            debug!("TrafficSim peer {} moved from {} to {}", agent, self.addr, from);
            self.addr = from;
        }
        if seq == 1 {
            self.expected_seq = 2;
            return;
        }
        if seq > self.expected_seq {
            debug!(
                "TrafficSim peer {} skipped from seq {} to {}",
                agent, self.expected_seq, seq
            );
        } else if seq < self.expected_seq {
            debug!(
                "TrafficSim peer {} sent seq {} out of order (expected {})",
                agent, seq, self.expected_seq
            );
        }
        self.expected_seq = self.expected_seq.max(seq.saturating_add(1));
    }
}

pub(crate) type PeerTable = HashMap<AgentId, PeerConnection>;

/// Shared-port listener loop. Replies to HELLO and DATA from allow-listed
/// agents addressed to `local_agent`; everything else is dropped silently.
pub(crate) async fn serve(
    socket: UdpSocket,
    local_agent: AgentId,
    allow: Arc<AllowList>,
    idle_timeout: Duration,
    mut stop: StopListener,
) {
    enum Event {
        Stop,
        Reap,
        Datagram(std::io::Result<(usize, SocketAddr)>),
    }

    let mut peers = PeerTable::new();
    let mut buffer = vec![0_u8; MAX_DATAGRAM];
    let mut reaper = tokio::time::interval(idle_timeout.max(MIN_REAP_PERIOD));
    reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            () = stop.wait() => Event::Stop,
            _ = reaper.tick() => Event::Reap,
            received = socket.recv_from(&mut buffer) => Event::Datagram(received),
        };
        match event {
            Event::Stop => break,
            Event::Reap => reap_idle(&mut peers, idle_timeout),
            Event::Datagram(Ok((length, from))) => {
                let Some(bytes) = buffer.get(..length) else {
                    continue;
                };
                if let Some(reply) = handle_datagram(bytes, from, &local_agent, &allow, &mut peers) {
                    send_reply(&socket, &reply, from).await;
                }
            }
            Event::Datagram(Err(err)) => debug!("TrafficSim listener receive error: {}", err),
        }
    }
    debug!("TrafficSim listener for {} closed", local_agent);
}

/// Decides the reply to one datagram.
pub(crate) fn handle_datagram(
    bytes: &[u8],
    from: SocketAddr,
    local_agent: &AgentId,
    allow: &AllowList,
    peers: &mut PeerTable,
) -> Option<WireMessage> {
    let message = match WireMessage::decode(bytes) {
        Ok(message) => message,
        Err(err) => {
            trace!("TrafficSim listener dropping datagram from {}: {}", from, err);
            return None;
        }
    };
    if message.dst != *local_agent {
        trace!(
            "TrafficSim listener dropping datagram for {} from {}",
            message.dst, from
        );
        return None;
    }
    if !allow.contains(&message.src) {
        trace!(
            "TrafficSim listener dropping datagram from unlisted agent {} at {}",
            message.src, from
        );
        return None;
    }

    match message.kind {
        MessageKind::Hello => {
            if peers
                .insert(message.src.clone(), PeerConnection::new(from))
                .is_none()
            {
                info!("TrafficSim peer {} connected from {}", message.src, from);
            }
            Some(WireMessage::hello_ack(local_agent, &message.src, wall_clock_ms()))
        }
        MessageKind::Data => {
            let Some(seq) = message.data.seq else {
                trace!("TrafficSim DATA without seq from {}", message.src);
                return None;
            };
            peers
                .entry(message.src.clone())
                .or_insert_with(|| PeerConnection::new(from))
                .observe(&message.src, seq, from);
            Some(WireMessage::data_ack(
                local_agent,
                &message.src,
                &message.data,
                wall_clock_ms(),
            ))
        }
        MessageKind::Ack => None,
    }
}

pub(crate) fn reap_idle(peers: &mut PeerTable, idle_timeout: Duration) {
    peers.retain(|agent, peer| {
        let keep = peer.last_seen.elapsed() < idle_timeout;
        if !keep {
            info!("TrafficSim peer {} idle; forgetting {}", agent, peer.addr);
        }
        keep
    });
}

async fn send_reply(socket: &UdpSocket, reply: &WireMessage, to: SocketAddr) {
    let bytes = match reply.encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!("TrafficSim listener failed to encode reply: {}", err);
            return;
        }
    };
    if let Err(err) = socket.send_to(&bytes, to).await {
        debug!("TrafficSim listener failed to reply to {}: {}", to, err);
    }
}
