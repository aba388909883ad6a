use serde_json::Value;

use crate::common::node::NodeUpdate;
use crate::handler::context::HandlerContext;
use crate::router::CommandSource;

/// `updateNodes`: an array of node attribute objects. Known nodes are
/// merged in place, unknown ones are registered as new.
pub fn handle_update_nodes(data: Value, source: &CommandSource, ctx: &HandlerContext) {
    let updates: Vec<NodeUpdate> = match serde_json::from_value(data) {
        Ok(updates) => updates,
        Err(e) => {
            log::warn!("updateNodes payload from {} did not parse: {}", source, e);
            return;
        }
    };
    log::debug!("updateNodes from {}: {} node(s)", source, updates.len());
    for update in updates {
        ctx.registry.upsert(update);
    }
}
