use crate::handlers::NodeHandler;
use crate::{ContextStore, Graph, Node, Outcome, Preamble, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Pass-through: the edge selector does the branching work.
#[derive(Debug, Default)]
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    async fn execute(
        &self,
        _node: &Node,
        _context: &ContextStore,
        _graph: &Graph,
        _preamble: &Preamble,
        _cancel: &CancellationToken,
    ) -> Result<Outcome> {
        Ok(Outcome::success())
    }
}
