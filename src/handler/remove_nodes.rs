use serde_json::Value;

use crate::handler::context::HandlerContext;
use crate::router::CommandSource;

/// `removeNodes`: an array of addresses that have left the swarm.
pub fn handle_remove_nodes(data: Value, source: &CommandSource, ctx: &HandlerContext) {
    let addresses: Vec<String> = match serde_json::from_value(data) {
        Ok(addresses) => addresses,
        Err(e) => {
            log::warn!("removeNodes payload from {} did not parse: {}", source, e);
            return;
        }
    };
    log::debug!("removeNodes from {}: {:?}", source, addresses);
    for address in addresses {
        ctx.registry.remove(&address);
    }
}
