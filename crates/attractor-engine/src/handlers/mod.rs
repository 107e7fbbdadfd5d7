use crate::{ContextStore, Graph, Node, Outcome, Preamble, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub mod codergen;
pub mod conditional;
pub mod exit;
pub mod fan_in;
pub mod manager_loop;
pub mod parallel;
pub mod registry;
pub mod start;
pub mod tool;
pub mod wait_human;

use tokio_util::sync::CancellationToken;

/// The behavior bound to a node type. Handlers read the context and the
/// fidelity-resolved preamble and communicate back through the returned
/// [`Outcome`]; the engine owns merging, routing, and checkpointing.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextStore,
        graph: &Graph,
        preamble: &Preamble,
        cancel: &CancellationToken,
    ) -> Result<Outcome>;
}

pub type SharedNodeHandler = Arc<dyn NodeHandler>;

/// Registry with the built-in handler set. The `parallel` type is driven
/// by the engine itself (the fan-out needs the registry to run branch
/// sub-traversals); registering a custom handler under `parallel`
/// overrides that.
pub fn core_registry() -> registry::HandlerRegistry {
    let mut registry = registry::HandlerRegistry::new();
    registry.register("start", Arc::new(start::StartHandler));
    registry.register("exit", Arc::new(exit::ExitHandler));
    registry.register("conditional", Arc::new(conditional::ConditionalHandler));
    registry.register(
        "codergen",
        Arc::new(codergen::CodergenHandler::simulated()),
    );
    registry.register(
        "wait.human",
        Arc::new(wait_human::WaitHumanHandler::new(Arc::new(
            crate::AutoApproveInterviewer,
        ))),
    );
    registry.register(
        "tool",
        Arc::new(tool::ToolHandler::new(Arc::new(tool::LocalProcessRunner))),
    );
    registry.register("parallel.fan_in", Arc::new(fan_in::FanInHandler));
    registry.register(
        "stack.manager_loop",
        Arc::new(manager_loop::ManagerLoopHandler),
    );
    registry
}
