//! Walks a [`PlanTemplate`] end to end, driving stage fan-out, join
//! invocation, cancellation pre-fill, and the per-request explain trace.

pub mod explain;

pub use explain::ExecExplain;

use crate::blueprint::{NodeKind, PlanTemplate};
use crate::bulkhead::Bulkhead;
use crate::catalog::{CatalogError, Lifetime, ModuleCatalog, ThreadSafety};
use crate::context::FlowContext;
use crate::module::{JoinDelegate, ModuleContext};
use crate::outcome::{Outcome, OutcomeKind};
use crate::patch::PatchEvaluation;
use crate::planner::StageFanoutPlanner;
use crate::selectors::SelectorRegistry;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, miette::Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] crate::context::ContextError),
}

/// Registry of join delegates keyed by the join node's declared name, owned
/// by whoever assembles the flow (mirrors [`ModuleCatalog`]'s shape).
#[derive(Default)]
pub struct JoinRegistry {
    delegates: FxHashMap<String, JoinDelegate>,
}

impl JoinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_name: impl Into<String>, delegate: JoinDelegate) {
        self.delegates.insert(node_name.into(), delegate);
    }
}

/// The flow-level outcome plus the structured trace of how it was reached.
pub struct ExecutionResult {
    pub outcome: Outcome<Value>,
    pub explain: ExecExplain,
}

pub struct ExecutionEngine<'a> {
    pub catalog: &'a ModuleCatalog,
    pub selectors: &'a SelectorRegistry,
    pub bulkhead: &'a Bulkhead,
    pub joins: &'a JoinRegistry,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(
        catalog: &'a ModuleCatalog,
        selectors: &'a SelectorRegistry,
        bulkhead: &'a Bulkhead,
        joins: &'a JoinRegistry,
    ) -> Self {
        Self {
            catalog,
            selectors,
            bulkhead,
            joins,
        }
    }

    /// Executes `template` against `ctx`, attaching `evaluation` for the
    /// lifetime of the call and clearing it on every exit path (§5).
    pub async fn execute(
        &self,
        template: &PlanTemplate,
        evaluation: Option<Arc<PatchEvaluation>>,
    ) -> Result<ExecutionResult, EngineError> {
        let ctx = FlowContext::new(
            Default::default(),
            None,
            Default::default(),
            tokio_util::sync::CancellationToken::new(),
            Instant::now() + std::time::Duration::from_secs(30),
        )?;
        self.execute_with_context(template, evaluation, &ctx).await
    }

    pub async fn execute_with_context(
        &self,
        template: &PlanTemplate,
        evaluation: Option<Arc<PatchEvaluation>>,
        ctx: &FlowContext,
    ) -> Result<ExecutionResult, EngineError> {
        let mut explain = ExecExplain::new(template.nodes.iter().map(|n| n.name.clone()));
        if let Some(eval) = &evaluation {
            explain.record_overlays(&eval.overlays_applied);
            ctx.attach_patch_evaluation(eval.clone());
        }

        let result = self
            .run_nodes(template, evaluation.as_deref(), ctx, &mut explain)
            .await;
        ctx.clear_patch_evaluation();
        result.map(|outcome| ExecutionResult { outcome, explain })
    }

    /// The body of [`Self::execute_with_context`], split out so the caller
    /// can run `ctx.clear_patch_evaluation()` on every exit path, including
    /// the `?`-propagated error paths below.
    async fn run_nodes(
        &self,
        template: &PlanTemplate,
        evaluation: Option<&PatchEvaluation>,
        ctx: &FlowContext,
        explain: &mut ExecExplain,
    ) -> Result<Outcome<Value>, EngineError> {
        let mut executed_stages: HashSet<String> = HashSet::new();
        let mut last_outcome: Outcome<Value> = Outcome::Unspecified;
        let mut canceled = false;

        for node in &template.nodes {
            if canceled {
                break;
            }

            if let Some(stage_name) = &node.stage_name {
                if executed_stages.contains(stage_name) {
                    continue;
                }
                executed_stages.insert(stage_name.clone());
                last_outcome = self
                    .run_stage(stage_name, template, evaluation, ctx, explain)
                    .await?;
                if ctx.cancellation.is_cancelled() {
                    canceled = true;
                }
                continue;
            }

            match node.kind {
                NodeKind::Step => {
                    let start = Instant::now();
                    explain.record_node_start(&node.name, start);
                    let outcome = self.run_step(node, ctx).await?;
                    let end = Instant::now();
                    explain.record_node_end(&node.name, end, outcome.kind(), outcome.code());
                    ctx.record_outcome(&node.name, outcome.clone())?;
                    last_outcome = outcome;
                    if ctx.cancellation.is_cancelled() {
                        canceled = true;
                    }
                }
                NodeKind::Join => {
                    let start = Instant::now();
                    explain.record_node_start(&node.name, start);
                    let outcome = match self.joins.delegates.get(&node.name) {
                        Some(delegate) => delegate(ctx).await,
                        None => Outcome::error("JOIN_NOT_REGISTERED"),
                    };
                    let end = Instant::now();
                    explain.record_node_end(&node.name, end, outcome.kind(), outcome.code());
                    ctx.record_outcome(&node.name, outcome.clone())?;
                    last_outcome = outcome;
                    if ctx.cancellation.is_cancelled() {
                        canceled = true;
                    }
                }
            }
        }

        if canceled {
            last_outcome = self.fold_cancellation(template, ctx)?;
        }

        Ok(last_outcome)
    }

    async fn run_step(
        &self,
        node: &crate::blueprint::BlueprintNode,
        ctx: &FlowContext,
    ) -> Result<Outcome<Value>, EngineError> {
        let Some(type_name) = &node.module_type else {
            return Ok(Outcome::error("MISSING_MODULE_TYPE"));
        };
        let descriptor = match self.catalog.resolve(type_name) {
            Ok(d) => d,
            Err(_) => return Ok(Outcome::error("MODULE_TYPE_NOT_REGISTERED")),
        };

        let permit = descriptor.try_enter()?;

        let module = descriptor.acquire();
        let module_ctx = ModuleContext {
            module_id: node.name.clone(),
            type_name: type_name.clone(),
            args: Value::Object(Default::default()),
            cancellation: ctx.cancellation.clone(),
            deadline: ctx.deadline,
            flow: ctx,
        };
        let outcome = self.invoke(&*module, module_ctx, ctx).await;
        drop(permit);
        Ok(outcome)
    }

    /// Resolves and invokes one fan-out-planned module, returning its id
    /// paired with the outcome so callers can fan these out concurrently
    /// without losing track of which module produced which result.
    async fn run_planned(
        &self,
        planned: &crate::planner::PlannedModule,
        ctx: &FlowContext,
    ) -> Result<(String, Outcome<Value>), EngineError> {
        let descriptor = match self.catalog.resolve(&planned.use_type) {
            Ok(d) => d,
            Err(_) => {
                return Ok((planned.id.clone(), Outcome::error("MODULE_TYPE_NOT_REGISTERED")))
            }
        };
        let permit = descriptor.try_enter()?;
        let module = descriptor.acquire();
        let module_ctx = ModuleContext {
            module_id: planned.id.clone(),
            type_name: planned.use_type.clone(),
            args: planned.with.clone(),
            cancellation: ctx.cancellation.clone(),
            deadline: ctx.deadline,
            flow: ctx,
        };
        let outcome = self.invoke(&*module, module_ctx, ctx).await;
        drop(permit);
        Ok((planned.id.clone(), outcome))
    }

    async fn run_stage(
        &self,
        stage_name: &str,
        template: &PlanTemplate,
        evaluation: Option<&PatchEvaluation>,
        ctx: &FlowContext,
        explain: &mut ExecExplain,
    ) -> Result<Outcome<Value>, EngineError> {
        let contract = template.stage_contract(stage_name);
        let empty_stage = crate::patch::EffectiveStage::default();
        let stage = evaluation
            .and_then(|e| e.stages.get(stage_name))
            .unwrap_or(&empty_stage);

        let snapshot = StageFanoutPlanner::plan(
            stage,
            &contract,
            ctx,
            self.selectors,
            self.bulkhead,
            &template.flow_name,
        );
        explain.record_stage(stage_name, &snapshot);

        // Primary modules run as concurrent tasks polled together via
        // `try_join_all`, rather than one after another, so one module's I/O
        // wait doesn't block the next module's from starting, and a
        // `MODULE_CONCURRENCY_VIOLATION` from any of them short-circuits the
        // rest instead of being silently swallowed.
        let primary_futures = snapshot
            .primary
            .iter()
            .map(|planned| self.run_planned(planned, ctx));
        let primary_outcomes: Vec<(String, Outcome<Value>)> =
            futures_util::future::try_join_all(primary_futures).await?;

        let shadow_futures = snapshot
            .shadow
            .iter()
            .map(|planned| self.run_planned(planned, ctx));
        // Shadow outcomes are deliberately not recorded in node_outcomes.
        let _: Vec<(String, Outcome<Value>)> = futures_util::future::try_join_all(shadow_futures).await?;

        // Bulkhead permits are held by `snapshot`'s `PlannedModule`s for the
        // duration of execution above. Record a permit-free clone for join
        // nodes to inspect and drop the original now, releasing the slots
        // immediately rather than holding them for the rest of the request.
        let recorded = snapshot.clone();
        drop(snapshot);
        ctx.record_stage_snapshot(stage_name, recorded);

        let mut last = Outcome::Unspecified;
        for (module_id, outcome) in primary_outcomes {
            ctx.record_outcome(&module_id, outcome.clone())?;
            last = outcome;
        }
        Ok(last)
    }

    async fn invoke(
        &self,
        module: &dyn crate::module::Module,
        module_ctx: ModuleContext<'_>,
        ctx: &FlowContext,
    ) -> Outcome<Value> {
        if Instant::now() >= ctx.deadline {
            return Outcome::timeout("DEADLINE_EXCEEDED");
        }
        let deadline_sleep = tokio::time::sleep_until(ctx.deadline.into());
        tokio::select! {
            outcome = module.execute(module_ctx) => outcome,
            _ = ctx.cancellation.cancelled() => {
                if Instant::now() >= ctx.deadline {
                    Outcome::timeout("DEADLINE_EXCEEDED")
                } else {
                    Outcome::canceled("UPSTREAM_CANCELED")
                }
            }
            () = deadline_sleep => {
                ctx.cancellation.cancel();
                Outcome::timeout("DEADLINE_EXCEEDED")
            }
        }
    }

    /// Pre-fills every plan node that never recorded an outcome with
    /// `Unspecified` (zero timestamps) and folds the flow-level outcome to
    /// `Canceled("UPSTREAM_CANCELED")` or `Timeout("DEADLINE_EXCEEDED")`
    /// depending on which one tripped the shared cancellation token, per
    /// §4.8. The per-node outcome already recorded for the node that
    /// observed cancellation stands on its own; only the flow-level result
    /// is overridden.
    fn fold_cancellation(
        &self,
        template: &PlanTemplate,
        ctx: &FlowContext,
    ) -> Result<Outcome<Value>, EngineError> {
        for node in &template.nodes {
            if !ctx.has_node_outcome(&node.name) {
                ctx.record_outcome::<Value>(&node.name, Outcome::Unspecified)?;
            }
        }
        if Instant::now() >= ctx.deadline {
            Ok(Outcome::timeout("DEADLINE_EXCEEDED"))
        } else {
            Ok(Outcome::canceled("UPSTREAM_CANCELED"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::BlueprintBuilder;
    use crate::catalog::ModuleCatalog;
    use crate::module::Module;
    use async_trait::async_trait;

    struct AlwaysOk;
    #[async_trait]
    impl Module for AlwaysOk {
        async fn execute(&self, _ctx: ModuleContext<'_>) -> Outcome<Value> {
            Outcome::ok(Value::String("done".to_string()))
        }
    }

    #[tokio::test]
    async fn single_step_flow_returns_its_outcome() {
        let template = BlueprintBuilder::new("flow").step("a", "AlwaysOk").build().unwrap();
        let catalog = ModuleCatalog::new();
        catalog
            .register(
                "AlwaysOk",
                Arc::new(|| Arc::new(AlwaysOk) as Arc<dyn Module>),
                "Args",
                "Out",
                Lifetime::Transient,
                ThreadSafety::ThreadSafe,
                None,
                None,
            )
            .unwrap();
        let selectors = SelectorRegistry::empty();
        let bulkhead = Bulkhead::new();
        let joins = JoinRegistry::new();
        let engine = ExecutionEngine::new(&catalog, &selectors, &bulkhead, &joins);
        let result = engine.execute(&template, None).await.unwrap();
        assert_eq!(result.outcome.kind(), OutcomeKind::Ok);
    }
}
