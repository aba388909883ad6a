use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an inbound frame came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSource {
    EntryPoint,
    /// A per-node connection, identified by the node's address.
    Node(String),
}

impl std::fmt::Display for CommandSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandSource::EntryPoint => write!(f, "entry point"),
            CommandSource::Node(address) => write!(f, "node {}", address),
        }
    }
}

/// The wire envelope: one JSON object per frame, `cmd` naming the command
/// and `data` carrying its payload.
#[derive(Debug, Deserialize)]
struct Envelope {
    cmd: String,
    #[serde(default)]
    data: Value,
}

/// Commands this client sends to the swarm.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", content = "data", rename_all = "camelCase")]
pub enum OutboundCommand {
    RequestAllNodes,
}

/// Serialize an outbound command to a single newline-free frame, stamped
/// with a sequence number the receiver is free to ignore.
pub fn encode_frame(command: &OutboundCommand, seq: u64) -> Result<String> {
    let mut value = serde_json::to_value(command)?;
    if let Value::Object(map) = &mut value {
        map.insert("seq".to_string(), seq.into());
    }
    Ok(value.to_string())
}

pub type CommandHandler = Arc<dyn Fn(Value, &CommandSource) + Send + Sync>;

/// Maps command names to handlers.
///
/// Handlers register themselves during startup in no particular order.
/// Re-registering a name replaces the previous handler; the last writer
/// wins, which lets tests rebind a command against a fresh context.
#[derive(Default)]
pub struct CommandRouter {
    handlers: RwLock<HashMap<String, CommandHandler>>,
}

impl CommandRouter {
    pub fn new() -> CommandRouter {
        CommandRouter::default()
    }

    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(Value, &CommandSource) + Send + Sync + 'static,
    {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(handler))
            .is_some();
        if replaced {
            log::warn!("command {:?} re-registered, previous handler replaced", name);
        }
    }

    /// Parse a raw frame and invoke the matching handler.
    ///
    /// Malformed JSON and unknown commands are logged and dropped; nothing
    /// here propagates an error that could tear down the connection.
    pub fn dispatch(&self, raw: &str, source: &CommandSource) {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping malformed frame from {}: {}", source, e);
                return;
            }
        };
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.cmd)
            .cloned();
        match handler {
            Some(handler) => {
                log::debug!("dispatching {:?} from {}", envelope.cmd, source);
                handler(envelope.data, source);
            }
            None => log::warn!(
                "no handler registered for command {:?} from {}",
                envelope.cmd,
                source
            ),
        }
    }
}
