use crate::handlers::NodeHandler;
use crate::{ContextStore, Graph, Node, Outcome, Preamble, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Terminal marker. The engine performs goal-gate enforcement after this
/// handler returns.
#[derive(Debug, Default)]
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    async fn execute(
        &self,
        _node: &Node,
        _context: &ContextStore,
        _graph: &Graph,
        _preamble: &Preamble,
        _cancel: &CancellationToken,
    ) -> Result<Outcome> {
        Ok(Outcome::success_with_notes("pipeline reached exit"))
    }
}
