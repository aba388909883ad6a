use std::sync::Arc;

use crate::registry::NodeRegistry;

#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Arc<NodeRegistry>,
}
