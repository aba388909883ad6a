use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::common::config::SwarmConfig;
use crate::common::node::{now_millis, ConnectionState, Node, NodeState};
use crate::registry::NodeRegistry;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub grace_period_ms: i64,
    pub silence_timeout_ms: i64,
    pub removal_linger_ms: i64,
}

impl From<&SwarmConfig> for LivenessConfig {
    fn from(config: &SwarmConfig) -> LivenessConfig {
        LivenessConfig {
            grace_period_ms: config.grace_period_ms as i64,
            silence_timeout_ms: config.silence_timeout_ms as i64,
            removal_linger_ms: config.removal_linger_ms as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MarkAlive,
    MarkDead,
    Remove,
}

/// Derive the next health transition for a node, if any.
///
/// A new node graduates to alive once the grace period has passed and it
/// has produced traffic since registration. Silence past the timeout marks
/// any node dead, including one that never left `New`. A dead node that
/// speaks again goes straight back to alive; one that stays dead past the
/// linger is removed, but never while its connection is still opening or
/// open.
pub fn classify(node: &Node, now: i64, config: &LivenessConfig) -> Option<Transition> {
    let silent = now - node.last_update >= config.silence_timeout_ms;
    match node.node_state {
        NodeState::New => {
            if silent {
                Some(Transition::MarkDead)
            } else if node.last_update > node.created_at
                && now - node.created_at >= config.grace_period_ms
            {
                Some(Transition::MarkAlive)
            } else {
                None
            }
        }
        NodeState::Alive => silent.then_some(Transition::MarkDead),
        NodeState::Dead => {
            if !silent {
                Some(Transition::MarkAlive)
            } else if node.connection_state == ConnectionState::Closed
                && node
                    .dead_since
                    .is_some_and(|since| now - since >= config.removal_linger_ms)
            {
                Some(Transition::Remove)
            } else {
                None
            }
        }
    }
}

/// Reclassifies every node on a fixed interval. Holds no state of its own;
/// everything it needs lives on the nodes themselves.
pub struct LivenessMonitor {
    registry: Arc<NodeRegistry>,
    config: LivenessConfig,
    poll_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<NodeRegistry>, config: &SwarmConfig) -> LivenessMonitor {
        LivenessMonitor {
            registry,
            config: LivenessConfig::from(config),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => self.evaluate(now_millis()),
                }
            }
        })
    }

    /// One reclassification pass over the registry snapshot.
    pub fn evaluate(&self, now: i64) {
        for node in self.registry.all() {
            match classify(&node, now, &self.config) {
                Some(Transition::MarkAlive) => {
                    log::info!("node {} is alive", node.address);
                    self.registry.set_node_state(&node.address, NodeState::Alive);
                }
                Some(Transition::MarkDead) => {
                    log::warn!("node {} went silent, marking dead", node.address);
                    self.registry.set_node_state(&node.address, NodeState::Dead);
                }
                Some(Transition::Remove) => {
                    log::info!("pruning dead node {}", node.address);
                    self.registry.remove(&node.address);
                }
                None => {}
            }
        }
    }
}
