pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::config::{load_swarm_config, SwarmConfig};
use crate::common::node::{read_node, ConnectionState};
use crate::handler::{context::HandlerContext, register_handlers};
use crate::monitor::LivenessMonitor;
use crate::registry::NodeRegistry;
use crate::router::{encode_frame, CommandRouter, CommandSource, OutboundCommand};

struct ConnectionHandle {
    id: u64,
    token: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
}

/// Owns every transport connection: the ephemeral entry-point bootstrap and
/// one connection per registry node.
///
/// A connection never re-enters `Opening` from `Closed`; reconnection is a
/// new connection with a fresh id and cancellation token, initiated by the
/// supervisory sweep. The id doubles as a fence: a task whose id no longer
/// matches the stored handle may not dispatch frames or touch node state.
pub struct ConnectionSupervisor {
    registry: Arc<NodeRegistry>,
    router: Arc<CommandRouter>,
    config: SwarmConfig,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    entry: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    next_conn_id: AtomicU64,
    next_seq: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        router: Arc<CommandRouter>,
        config: SwarmConfig,
    ) -> Arc<ConnectionSupervisor> {
        Arc::new(ConnectionSupervisor {
            registry,
            router,
            config,
            connections: Mutex::new(HashMap::new()),
            entry: Mutex::new(None),
            shutdown: CancellationToken::new(),
            next_conn_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Open the bootstrap connection used only to discover the initial node
    /// list. Retries on a fixed delay until cancelled; retired by the sweep
    /// once any per-node connection is open.
    pub fn connect_entry_point(self: &Arc<Self>, ip: &str, port: u16) {
        let mut entry = self.entry_lock();
        if entry.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = self.shutdown.child_token();
        *entry = Some(token.clone());
        drop(entry);

        let supervisor = self.clone();
        let address = format!("{ip}:{port}");
        log::info!("connecting to entry point {}", address);
        tokio::spawn(run_entry_point(supervisor, address, token));
    }

    /// Open a connection to a node unless one is already owned for that
    /// address. The peer pushes its own node list on connect, so nothing is
    /// sent proactively.
    pub fn connect_to_node(self: &Arc<Self>, address: &str) {
        let (id, token, outbound_rx) = {
            let mut connections = self.connections_lock();
            if connections.contains_key(address) {
                return;
            }
            let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let token = self.shutdown.child_token();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            connections.insert(
                address.to_string(),
                ConnectionHandle {
                    id,
                    token: token.clone(),
                    outbound: outbound_tx,
                },
            );
            (id, token, outbound_rx)
        };
        let supervisor = self.clone();
        let address = address.to_string();
        tokio::spawn(run_node_connection(supervisor, address, id, token, outbound_rx));
    }

    /// Close every owned connection, the entry point included, and stop the
    /// sweep. Idempotent; the entry-point retry loop stops immediately, not
    /// on its next scheduled attempt.
    pub fn disconnect_all(&self) {
        if !self.shutdown.is_cancelled() {
            log::info!("disconnecting from all nodes");
            self.shutdown.cancel();
        }
    }

    pub fn entry_point_active(&self) -> bool {
        self.entry_lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    pub fn connection_count(&self) -> usize {
        self.connections_lock().len()
    }

    /// Queue a command for a node; dropped unless its connection is open.
    pub fn send_to_node(&self, address: &str, command: &OutboundCommand) {
        let frame = match encode_frame(command, self.next_seq()) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("failed to encode {:?}: {}", command, e);
                return;
            }
        };
        let open = self
            .registry
            .get(address)
            .is_some_and(|node| read_node(&node).connection_state == ConnectionState::Open);
        if !open {
            log::debug!("not sending {:?} to {}: connection not open", command, address);
            return;
        }
        if let Some(handle) = self.connections_lock().get(address) {
            if handle.outbound.send(frame).is_err() {
                log::debug!("connection to {} went away before send", address);
            }
        }
    }

    pub fn broadcast(&self, command: &OutboundCommand) {
        for node in self.registry.all() {
            self.send_to_node(&node.address, command);
        }
    }

    /// Spawn the supervisory sweep: retire the entry point once a per-node
    /// connection is open, drop connections whose node left the registry,
    /// and open at most one new connection per tick while below the
    /// concurrency ceiling.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(supervisor.config.sweep_interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = tick.tick() => supervisor.sweep(),
                }
            }
        })
    }

    fn sweep(self: &Arc<Self>) {
        let nodes = self.registry.all();

        if nodes
            .iter()
            .any(|node| node.connection_state == ConnectionState::Open)
        {
            self.retire_entry_point();
        }

        let orphans: Vec<String> = {
            let connections = self.connections_lock();
            connections
                .keys()
                .filter(|address| !nodes.iter().any(|node| &node.address == *address))
                .cloned()
                .collect()
        };
        for address in orphans {
            self.drop_connection(&address);
        }

        let candidate = {
            let connections = self.connections_lock();
            if connections.len() >= self.config.target_connections {
                None
            } else {
                nodes
                    .iter()
                    .find(|node| !connections.contains_key(&node.address))
                    .map(|node| node.address.clone())
            }
        };
        if let Some(address) = candidate {
            self.connect_to_node(&address);
        }
    }

    fn retire_entry_point(&self) {
        let mut entry = self.entry_lock();
        if let Some(token) = entry.take() {
            if !token.is_cancelled() {
                log::info!("a node connection is open, retiring entry point");
                token.cancel();
            }
        }
    }

    fn drop_connection(&self, address: &str) {
        let handle = self.connections_lock().remove(address);
        if let Some(handle) = handle {
            handle.token.cancel();
            self.registry.set_connection_state(address, ConnectionState::Closed);
        }
    }

    fn is_current(&self, address: &str, id: u64) -> bool {
        self.connections_lock()
            .get(address)
            .is_some_and(|handle| handle.id == id)
    }

    fn set_conn_state_if_current(&self, address: &str, id: u64, state: ConnectionState) {
        if self.is_current(address, id) {
            self.registry.set_connection_state(address, state);
        }
    }

    /// Release the handle for a finished connection task, unless it has
    /// already been superseded.
    fn finish_connection(&self, address: &str, id: u64) {
        let released = {
            let mut connections = self.connections_lock();
            match connections.get(address) {
                Some(handle) if handle.id == id => {
                    connections.remove(address);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.registry.set_connection_state(address, ConnectionState::Closed);
            log::debug!("connection {} to {} closed", id, address);
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn connections_lock(&self) -> MutexGuard<'_, HashMap<String, ConnectionHandle>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_lock(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_entry_point(
    supervisor: Arc<ConnectionSupervisor>,
    address: String,
    token: CancellationToken,
) {
    let retry = Duration::from_millis(supervisor.config.entry_retry_ms);
    while !token.is_cancelled() {
        if let Err(e) = entry_point_attempt(&supervisor, &address, &token).await {
            log::warn!("entry point {} failed: {:#}", address, e);
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(retry) => {}
        }
    }
    log::info!("entry point connection to {} retired", address);
}

async fn entry_point_attempt(
    supervisor: &Arc<ConnectionSupervisor>,
    address: &str,
    token: &CancellationToken,
) -> Result<()> {
    let mut framed = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        opened = transport::open(address) => opened?,
    };
    let frame = encode_frame(&OutboundCommand::RequestAllNodes, supervisor.next_seq())?;
    framed.send(frame).await?;
    log::info!("entry point {} open, requested node list", address);

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            inbound = framed.next() => match inbound {
                Some(Ok(line)) => supervisor.router.dispatch(&line, &CommandSource::EntryPoint),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }
}

async fn run_node_connection(
    supervisor: Arc<ConnectionSupervisor>,
    address: String,
    id: u64,
    token: CancellationToken,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    supervisor.set_conn_state_if_current(&address, id, ConnectionState::Opening);

    let mut framed = tokio::select! {
        _ = token.cancelled() => {
            supervisor.finish_connection(&address, id);
            return;
        }
        opened = transport::open(&address) => match opened {
            Ok(framed) => framed,
            Err(e) => {
                log::warn!("{:#}", e);
                supervisor.finish_connection(&address, id);
                return;
            }
        }
    };

    supervisor.set_conn_state_if_current(&address, id, ConnectionState::Open);
    log::info!("connection {} to {} open", id, address);
    let source = CommandSource::Node(address.clone());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        log::warn!("send to {} failed: {}", address, e);
                        break;
                    }
                }
                None => break,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(line)) => {
                    if !supervisor.is_current(&address, id) {
                        log::debug!("dropping frame from superseded connection {} to {}", id, address);
                        break;
                    }
                    supervisor.router.dispatch(&line, &source);
                }
                Some(Err(e)) => {
                    log::warn!("read error on connection to {}: {}", address, e);
                    break;
                }
                None => {
                    log::info!("{} closed the connection", address);
                    break;
                }
            }
        }
    }

    supervisor.set_conn_state_if_current(&address, id, ConnectionState::Closing);
    supervisor.finish_connection(&address, id);
}

/// The fully wired connection and liveness core: registry, router with its
/// handlers, supervisor, liveness monitor and change notifier.
pub struct Swarm {
    pub registry: Arc<NodeRegistry>,
    pub router: Arc<CommandRouter>,
    pub supervisor: Arc<ConnectionSupervisor>,
    config: SwarmConfig,
}

impl Swarm {
    /// Build the object graph and spawn its background tasks. Independent
    /// instances do not share any state.
    pub fn start(config: SwarmConfig) -> Swarm {
        let registry = Arc::new(NodeRegistry::new(Duration::from_millis(
            config.coalesce_window_ms,
        )));
        let router = Arc::new(CommandRouter::new());
        register_handlers(
            &router,
            HandlerContext {
                registry: registry.clone(),
            },
        );
        let supervisor = ConnectionSupervisor::new(registry.clone(), router.clone(), config.clone());
        let shutdown = supervisor.shutdown_token();
        registry.spawn_notifier(shutdown.clone());
        LivenessMonitor::new(registry.clone(), &config).spawn(shutdown);
        supervisor.spawn();
        Swarm {
            registry,
            router,
            supervisor,
            config,
        }
    }

    /// Begin discovery through the configured entry point.
    pub fn connect(&self) {
        self.supervisor
            .connect_entry_point(&self.config.entry_ip, self.config.entry_port);
    }

    pub fn shutdown(&self) {
        self.supervisor.disconnect_all();
        self.registry.clear();
    }
}

pub async fn swarm_start(config_path: &str) -> Result<()> {
    env_logger::init();
    log::info!("starting swarm console core...");
    let config = load_swarm_config(config_path)?;
    let swarm = Swarm::start(config);
    swarm.registry.on_nodes_changed(|nodes| {
        let alive = nodes
            .iter()
            .filter(|node| node.node_state == crate::common::node::NodeState::Alive)
            .count();
        log::info!("cluster view: {} node(s), {} alive", nodes.len(), alive);
    });
    swarm.connect();

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    swarm.shutdown();
    Ok(())
}
