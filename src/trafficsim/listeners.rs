use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TrafficSimError;
use crate::probe::{AgentId, ProbeId, SocketTarget};
use crate::shutdown::StopSignal;

use super::server;
use super::settings::TrafficSimSettings;

/// Agents a shared listener answers, tracked per dependent probe so that
/// one probe's update never drops another probe's peers.
#[derive(Debug, Default)]
pub struct AllowList {
    by_probe: RwLock<HashMap<ProbeId, BTreeSet<AgentId>>>,
}

impl AllowList {
    pub fn set(&self, probe: &ProbeId, agents: BTreeSet<AgentId>) {
        self.by_probe
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(probe.clone(), agents);
    }

    pub fn remove(&self, probe: &ProbeId) {
        self.by_probe
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(probe);
    }

    #[must_use]
    pub fn contains(&self, agent: &AgentId) -> bool {
        self.by_probe
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|agents| agents.contains(agent))
    }

    #[must_use]
    pub fn agents(&self) -> BTreeSet<AgentId> {
        self.by_probe
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}

struct SharedListener {
    local_addr: SocketAddr,
    allow: Arc<AllowList>,
    dependents: BTreeSet<ProbeId>,
    stop: StopSignal,
    task: JoinHandle<()>,
}

impl SharedListener {
    async fn shutdown(self, settings: &TrafficSimSettings) {
        self.stop.trigger();
        let mut task = self.task;
        match tokio::time::timeout(settings.teardown_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("TrafficSim listener task failed: {}", err),
            Err(_elapsed) => {
                warn!(
                    "TrafficSim listener on {} did not stop within {}ms; aborting",
                    self.local_addr,
                    settings.teardown_timeout.as_millis()
                );
                task.abort();
                if let Err(err) = task.await
                    && !err.is_cancelled()
                {
                    warn!("TrafficSim listener task failed: {}", err);
                }
            }
        }
    }
}

/// Process-wide table of TrafficSim server sockets keyed by listen port.
/// Several server probes on one port share a socket; it is closed when the
/// last of them releases it.
pub struct ListenerRegistry {
    local_agent: AgentId,
    settings: TrafficSimSettings,
    listeners: Mutex<HashMap<u16, SharedListener>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("local_agent", &self.local_agent)
            .finish_non_exhaustive()
    }
}

impl ListenerRegistry {
    #[must_use]
    pub fn new(local_agent: AgentId, settings: TrafficSimSettings) -> Self {
        Self {
            local_agent,
            settings,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `probe` on the listener for `bind`, creating it when the
    /// port is not bound yet. Repeated calls for the same probe only refresh
    /// its allow-list.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be resolved or bound.
    pub async fn acquire(
        &self,
        probe: &ProbeId,
        bind: &SocketTarget,
        peers: BTreeSet<AgentId>,
    ) -> Result<SocketAddr, TrafficSimError> {
        let mut listeners = self.listeners.lock().await;
        if bind.port != 0
            && let Some(listener) = listeners.get_mut(&bind.port)
        {
            listener.allow.set(probe, peers);
            if listener.dependents.insert(probe.clone()) {
                info!(
                    "TrafficSim server {} joined listener on {}",
                    probe, listener.local_addr
                );
            }
            return Ok(listener.local_addr);
        }

        let authority = bind.authority();
        let addr = tokio::net::lookup_host(authority.as_str())
            .await
            .map_err(|source| TrafficSimError::Resolve {
                target: authority.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| TrafficSimError::NoAddress {
                target: authority.clone(),
            })?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TrafficSimError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| TrafficSimError::Io {
            context: "listener address",
            source,
        })?;

        let allow = Arc::new(AllowList::default());
        allow.set(probe, peers);
        let (stop, listener) = StopSignal::new();
        let task = tokio::spawn(server::serve(
            socket,
            self.local_agent.clone(),
            Arc::clone(&allow),
            self.settings.idle_timeout,
            listener,
        ));
        listeners.insert(
            local_addr.port(),
            SharedListener {
                local_addr,
                allow,
                dependents: BTreeSet::from([probe.clone()]),
                stop,
                task,
            },
        );
        info!("TrafficSim server {} listening on {}", probe, local_addr);
        Ok(local_addr)
    }

    /// Replaces the agents `probe` admits. Returns false when the probe holds
    /// no listener.
    pub async fn update_peers(&self, probe: &ProbeId, peers: BTreeSet<AgentId>) -> bool {
        let listeners = self.listeners.lock().await;
        let Some(listener) = listeners
            .values()
            .find(|listener| listener.dependents.contains(probe))
        else {
            return false;
        };
        listener.allow.set(probe, peers);
        debug!(
            "TrafficSim server {} allow-list now {:?}",
            probe,
            listener.allow.agents()
        );
        true
    }

    /// Drops `probe` from its listener and closes the socket once no probe
    /// depends on it. Returns false when the probe held nothing.
    pub async fn release(&self, probe: &ProbeId) -> bool {
        let retired = {
            let mut listeners = self.listeners.lock().await;
            let Some(port) = listeners
                .iter()
                .find(|(_, listener)| listener.dependents.contains(probe))
                .map(|(port, _)| *port)
            else {
                return false;
            };
            let Some(listener) = listeners.get_mut(&port) else {
                return false;
            };
            listener.dependents.remove(probe);
            listener.allow.remove(probe);
            if listener.dependents.is_empty() {
                listeners.remove(&port)
            } else {
                None
            }
        };
        if let Some(listener) = retired {
            let local_addr = listener.local_addr;
            listener.shutdown(&self.settings).await;
            info!("TrafficSim listener on {} closed", local_addr);
        }
        true
    }

    pub async fn release_all(&self) {
        let drained: Vec<SharedListener> = {
            let mut listeners = self.listeners.lock().await;
            listeners.drain().map(|(_, listener)| listener).collect()
        };
        for listener in drained {
            listener.shutdown(&self.settings).await;
        }
    }

    pub async fn active_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub async fn local_addr(&self, probe: &ProbeId) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .await
            .values()
            .find(|listener| listener.dependents.contains(probe))
            .map(|listener| listener.local_addr)
    }

    pub async fn allowed_agents(&self, probe: &ProbeId) -> Option<BTreeSet<AgentId>> {
        self.listeners
            .lock()
            .await
            .values()
            .find(|listener| listener.dependents.contains(probe))
            .map(|listener| listener.allow.agents())
    }
}
