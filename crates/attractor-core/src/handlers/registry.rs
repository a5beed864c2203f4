use crate::Node;
use crate::handlers::{NodeKind, SharedNodeHandler};
use std::collections::BTreeMap;

/// Handler table keyed by [`NodeKind`]. Kinds without a registered handler
/// (custom `type` values included) resolve to the fallback handler, so an
/// author-defined stage degrades to an ordinary codergen stage instead of
/// halting the run.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<NodeKind, SharedNodeHandler>,
    fallback: Option<SharedNodeHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: NodeKind,
        handler: SharedNodeHandler,
    ) -> Option<SharedNodeHandler> {
        self.handlers.insert(kind, handler)
    }

    pub fn set_fallback(&mut self, handler: SharedNodeHandler) {
        self.fallback = Some(handler);
    }

    pub fn resolve(&self, node: &Node) -> Option<SharedNodeHandler> {
        self.handlers
            .get(&NodeKind::of(node))
            .or(self.fallback.as_ref())
            .cloned()
    }
}
