//! The module interface (§6): what a Step or stage-fanout module actually
//! executes. Modules are type-erased at the catalog boundary — args and
//! output travel as `serde_json::Value` so the catalog can dispatch by
//! string type name without generics leaking into the engine.

use crate::context::FlowContext;
use crate::outcome::Outcome;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a module body needs, scoped to one invocation.
pub struct ModuleContext<'a> {
    pub module_id: String,
    pub type_name: String,
    pub args: Value,
    pub cancellation: CancellationToken,
    pub deadline: std::time::Instant,
    pub flow: &'a FlowContext,
}

impl<'a> ModuleContext<'a> {
    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn deadline_exceeded(&self) -> bool {
        std::time::Instant::now() >= self.deadline
    }
}

/// Object-safe module body, registered in the [`crate::catalog::ModuleCatalog`]
/// under a type name and invoked by the execution engine.
#[async_trait]
pub trait Module: Send + Sync {
    async fn execute(&self, ctx: ModuleContext<'_>) -> Outcome<Value>;
}

/// Factory invoked by the catalog to produce a module instance: once per
/// `acquire` for `Transient` modules, once ever (memoized) for `Singleton`.
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

/// A join delegate reads prior node outcomes off the [`FlowContext`] and
/// produces the join's own typed (here, type-erased) outcome. Ported as a
/// boxed closure returning a boxed future so synchronously-ready joins and
/// genuinely suspending ones are handled uniformly by the engine.
pub type JoinDelegate = Arc<
    dyn for<'a> Fn(
            &'a FlowContext,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Outcome<Value>> + Send + 'a>>
        + Send
        + Sync,
>;
