//! Per-request mutable context: where node outcomes, stage snapshots, and
//! the active patch evaluation live for the lifetime of one `execute` call.
//!
//! `node_outcomes` stores each value behind `Box<dyn Any>` alongside the
//! `TypeId` it was written with (§9 "typed node outcomes stored
//! polymorphically"); the typed accessor checks the fingerprint and
//! surfaces [`ContextError::NodeTypeMismatch`] rather than panicking on a
//! bad downcast.

use crate::config::{ConfigError, ConfigSnapshot, ConfigSnapshotProvider};
use crate::outcome::Outcome;
use crate::patch::PatchEvaluation;
use crate::planner::StageFanoutSnapshot;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Programming-error signal from misuse of the [`FlowContext`] API. Per §7
/// these propagate as real errors rather than being folded into an
/// `Outcome` — they indicate a bug in the flow/join wiring, not a
/// request-time failure.
#[derive(Debug, Error, miette::Diagnostic)]
pub enum ContextError {
    #[error("node {0:?} already has a recorded outcome")]
    #[diagnostic(code(rockestra::context::node_already_recorded))]
    NodeAlreadyRecorded(String),
    #[error("node {0:?} outcome was read at a different type than it was written with")]
    #[diagnostic(
        code(rockestra::context::node_type_mismatch),
        help("the reader's type parameter must match the type the writer recorded")
    )]
    NodeTypeMismatch(String),
    #[error("deadline must be a specific future instant, not the default/zero value")]
    #[diagnostic(code(rockestra::context::missing_deadline))]
    MissingDeadline,
}

struct StoredOutcome {
    type_id: TypeId,
    value: Box<dyn Any + Send + Sync>,
}

/// Per-request, single-writer-concurrent-readers store of node outcomes.
#[derive(Default)]
struct NodeOutcomeStore {
    entries: RwLock<FxHashMap<String, StoredOutcome>>,
}

impl NodeOutcomeStore {
    fn record<T: Send + Sync + 'static>(
        &self,
        name: &str,
        outcome: Outcome<T>,
    ) -> Result<(), ContextError> {
        let mut guard = self.entries.write().expect("node outcome lock poisoned");
        if guard.contains_key(name) {
            return Err(ContextError::NodeAlreadyRecorded(name.to_string()));
        }
        guard.insert(
            name.to_string(),
            StoredOutcome {
                type_id: TypeId::of::<Outcome<T>>(),
                value: Box::new(outcome),
            },
        );
        Ok(())
    }

    fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Result<Outcome<T>, ContextError>>
    where
        Outcome<T>: Clone,
    {
        let guard = self.entries.read().expect("node outcome lock poisoned");
        let stored = guard.get(name)?;
        if stored.type_id != TypeId::of::<Outcome<T>>() {
            return Some(Err(ContextError::NodeTypeMismatch(name.to_string())));
        }
        let outcome = stored
            .value
            .downcast_ref::<Outcome<T>>()
            .expect("type id checked above")
            .clone();
        Some(Ok(outcome))
    }

    fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("node outcome lock poisoned")
            .contains_key(name)
    }

    fn recorded_names(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("node outcome lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// Per-request state shared between the engine, the planner, and module
/// bodies. One [`FlowContext`] is constructed per request by [`crate::host::FlowHost`].
pub struct FlowContext {
    pub request_id: uuid::Uuid,
    pub variants: FxHashMap<String, String>,
    pub user_id: Option<String>,
    pub request_attributes: FxHashMap<String, Value>,
    pub cancellation: CancellationToken,
    pub deadline: Instant,
    node_outcomes: NodeOutcomeStore,
    stage_snapshots: RwLock<FxHashMap<String, StageFanoutSnapshot>>,
    active_patch_evaluation: RwLock<Option<Arc<PatchEvaluation>>>,
    config_snapshot: RwLock<Option<Arc<ConfigSnapshot>>>,
}

impl FlowContext {
    /// Rejects a deadline that is already due: per §3, a `FlowContext` must
    /// carry a specific future instant, not the default/zero value a
    /// caller forgot to set.
    pub fn new(
        variants: FxHashMap<String, String>,
        user_id: Option<String>,
        request_attributes: FxHashMap<String, Value>,
        cancellation: CancellationToken,
        deadline: Instant,
    ) -> Result<Self, ContextError> {
        if deadline <= Instant::now() {
            return Err(ContextError::MissingDeadline);
        }
        Ok(Self {
            request_id: uuid::Uuid::new_v4(),
            variants,
            user_id,
            request_attributes,
            cancellation,
            deadline,
            node_outcomes: NodeOutcomeStore::default(),
            stage_snapshots: RwLock::new(FxHashMap::default()),
            active_patch_evaluation: RwLock::new(None),
            config_snapshot: RwLock::new(None),
        })
    }

    /// Fetches `flow_name`'s config snapshot through `provider` on first
    /// call and caches it for the life of this context (§4.4); every
    /// subsequent call returns the cached snapshot without invoking
    /// `provider` again.
    pub async fn get_or_fetch_snapshot(
        &self,
        provider: &dyn ConfigSnapshotProvider,
        flow_name: &str,
    ) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        if let Some(cached) = self
            .config_snapshot
            .read()
            .expect("config snapshot lock poisoned")
            .clone()
        {
            return Ok(cached);
        }
        let snapshot = Arc::new(provider.get_snapshot(flow_name).await?);
        *self
            .config_snapshot
            .write()
            .expect("config snapshot lock poisoned") = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub fn record_outcome<T: Send + Sync + 'static>(
        &self,
        node_name: &str,
        outcome: Outcome<T>,
    ) -> Result<(), ContextError> {
        self.node_outcomes.record(node_name, outcome)
    }

    pub fn node_outcome<T: Send + Sync + 'static>(
        &self,
        node_name: &str,
    ) -> Option<Result<Outcome<T>, ContextError>>
    where
        Outcome<T>: Clone,
    {
        self.node_outcomes.get(node_name)
    }

    pub fn has_node_outcome(&self, node_name: &str) -> bool {
        self.node_outcomes.contains(node_name)
    }

    pub fn recorded_node_names(&self) -> Vec<String> {
        self.node_outcomes.recorded_names()
    }

    pub fn record_stage_snapshot(&self, stage_name: &str, snapshot: StageFanoutSnapshot) {
        self.stage_snapshots
            .write()
            .expect("stage snapshot lock poisoned")
            .insert(stage_name.to_string(), snapshot);
    }

    pub fn stage_snapshot(&self, stage_name: &str) -> Option<StageFanoutSnapshot> {
        self.stage_snapshots
            .read()
            .expect("stage snapshot lock poisoned")
            .get(stage_name)
            .cloned()
    }

    /// Attaches the active patch evaluation for the life of this request.
    /// Symmetric with [`Self::clear_patch_evaluation`], which the engine
    /// calls on every exit path including the error path.
    pub fn attach_patch_evaluation(&self, evaluation: Arc<PatchEvaluation>) {
        *self
            .active_patch_evaluation
            .write()
            .expect("patch evaluation lock poisoned") = Some(evaluation);
    }

    pub fn active_patch_evaluation(&self) -> Option<Arc<PatchEvaluation>> {
        self.active_patch_evaluation
            .read()
            .expect("patch evaluation lock poisoned")
            .clone()
    }

    pub fn clear_patch_evaluation(&self) {
        *self
            .active_patch_evaluation
            .write()
            .expect("patch evaluation lock poisoned") = None;
    }
}
