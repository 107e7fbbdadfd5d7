use crate::handlers::NodeHandler;
use crate::{ContextStore, Graph, Node, Outcome, Preamble, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(
        &self,
        _node: &Node,
        _context: &ContextStore,
        _graph: &Graph,
        _preamble: &Preamble,
        _cancel: &CancellationToken,
    ) -> Result<Outcome> {
        Ok(Outcome::success_with_notes("pipeline started"))
    }
}
