use crate::handlers::SharedNodeHandler;
use crate::Node;
use std::collections::BTreeMap;

const DEFAULT_TYPE: &str = "codergen";

/// Maps handler type strings to handler instances. Node type resolution:
/// the explicit `type` attribute wins, then the fixed shape mapping, then
/// the default type.
pub struct HandlerRegistry {
    handlers: BTreeMap<String, SharedNodeHandler>,
    shape_types: BTreeMap<&'static str, &'static str>,
    default_type: String,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            shape_types: shape_type_mapping(),
            default_type: DEFAULT_TYPE.to_string(),
        }
    }

    pub fn register(
        &mut self,
        handler_type: impl Into<String>,
        handler: SharedNodeHandler,
    ) -> Option<SharedNodeHandler> {
        self.handlers.insert(handler_type.into(), handler)
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn resolve_type(&self, node: &Node) -> String {
        if let Some(node_type) = node.node_type.as_deref() {
            let trimmed = node_type.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        self.shape_types
            .get(node.shape.as_str())
            .map(|mapped| (*mapped).to_string())
            .unwrap_or_else(|| self.default_type.clone())
    }

    /// The handler for a node, falling back to the default type's handler
    /// when the resolved type has no registration.
    pub fn resolve(&self, node: &Node) -> Option<SharedNodeHandler> {
        let handler_type = self.resolve_type(node);
        self.handlers
            .get(&handler_type)
            .or_else(|| self.handlers.get(&self.default_type))
            .cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn shape_type_mapping() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("Mdiamond", "start"),
        ("Msquare", "exit"),
        ("box", "codergen"),
        ("hexagon", "wait.human"),
        ("diamond", "conditional"),
        ("component", "parallel"),
        ("tripleoctagon", "parallel.fan_in"),
        ("parallelogram", "tool"),
        ("house", "stack.manager_loop"),
    ])
}
