pub mod context;
pub mod remove_nodes;
pub mod update_nodes;

use context::HandlerContext;

use crate::router::CommandRouter;

/// Wire every inbound command to its handler. Registration order does not
/// matter; each handler closes over its own copy of the context.
pub fn register_handlers(router: &CommandRouter, ctx: HandlerContext) {
    {
        let ctx = ctx.clone();
        router.register("updateNodes", move |data, source| {
            update_nodes::handle_update_nodes(data, source, &ctx)
        });
    }
    router.register("removeNodes", move |data, source| {
        remove_nodes::handle_remove_nodes(data, source, &ctx)
    });
}
