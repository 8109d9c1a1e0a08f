//! Immutable, typed description of a flow: ordered nodes, stage grouping,
//! per-stage contracts, and a stable plan hash.
//!
//! Blueprints are assembled through [`BlueprintBuilder`], a fluent API owned
//! by a single thread, and frozen into a [`PlanTemplate`] by [`BlueprintBuilder::build`].

mod hash;

pub use hash::plan_hash;

use rustc_hash::FxHashMap;
use std::collections::HashSet;
use thiserror::Error;

/// A node's shape within the plan: either a statically bound module
/// invocation, or a join that reads prior outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Step,
    Join,
}

/// Fully qualified type name of a join's output type, captured at build
/// time and folded into the plan hash so a join whose output type changes
/// produces a different fingerprint.
pub type JoinOutputFingerprint = String;

/// One node in a [`PlanTemplate`].
#[derive(Debug, Clone)]
pub struct BlueprintNode {
    pub kind: NodeKind,
    pub name: String,
    pub stage_name: Option<String>,
    /// Statically bound module type; only meaningful for `Step` nodes.
    pub module_type: Option<String>,
    /// Fully qualified output type name; only meaningful for `Join` nodes.
    pub join_output_type: Option<JoinOutputFingerprint>,
}

/// Inclusive clamp range for a stage's `fanoutMax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutRange {
    pub min: u32,
    pub max: u32,
}

/// Per-stage policy attached at blueprint build time. Patch-supplied
/// modules are checked against this contract before anything else runs.
#[derive(Debug, Clone)]
pub struct StageContract {
    pub allow_dynamic_modules: bool,
    pub allowed_module_types: Option<HashSet<String>>,
    pub max_modules_warn: u32,
    pub max_modules_hard: u32,
    pub allow_shadow: bool,
    pub max_shadow_modules: u32,
    pub max_shadow_sample_bps: u32,
    pub fanout_max_range: FanoutRange,
}

impl Default for StageContract {
    fn default() -> Self {
        Self {
            allow_dynamic_modules: false,
            allowed_module_types: None,
            max_modules_warn: 8,
            max_modules_hard: 16,
            allow_shadow: false,
            max_shadow_modules: 4,
            max_shadow_sample_bps: 10_000,
            fanout_max_range: FanoutRange { min: 0, max: 16 },
        }
    }
}

/// Errors raised while assembling a blueprint. These are design-time
/// errors: they never occur once a blueprint has been built successfully.
#[derive(Debug, Error, miette::Diagnostic)]
pub enum BlueprintError {
    #[error("flow name must not be empty")]
    #[diagnostic(code(rockestra::blueprint::empty_flow_name))]
    EmptyFlowName,
    #[error("node name must not be empty")]
    #[diagnostic(code(rockestra::blueprint::empty_node_name))]
    EmptyNodeName,
    #[error("duplicate node name: {0}")]
    #[diagnostic(code(rockestra::blueprint::duplicate_node_name))]
    DuplicateNodeName(String),
    #[error("duplicate stage name: {0}")]
    #[diagnostic(code(rockestra::blueprint::duplicate_stage_name))]
    DuplicateStageName(String),
    #[error("stage {0:?} was declared but contains no nodes")]
    #[diagnostic(code(rockestra::blueprint::empty_stage))]
    EmptyStage(String),
    #[error("blueprint has no nodes")]
    #[diagnostic(code(rockestra::blueprint::empty_blueprint))]
    EmptyBlueprint,
}

/// Immutable, validated flow description produced by [`BlueprintBuilder::build`].
#[derive(Debug, Clone)]
pub struct PlanTemplate {
    pub flow_name: String,
    pub nodes: Vec<BlueprintNode>,
    node_name_to_index: FxHashMap<String, usize>,
    pub stage_contracts: FxHashMap<String, StageContract>,
    pub plan_hash: u64,
}

impl PlanTemplate {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.node_name_to_index.get(name).copied()
    }

    pub fn node(&self, name: &str) -> Option<&BlueprintNode> {
        self.index_of(name).map(|i| &self.nodes[i])
    }

    pub fn stage_contract(&self, stage_name: &str) -> StageContract {
        self.stage_contracts
            .get(stage_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Node names belonging to `stage_name`, in declaration order.
    pub fn stage_node_names(&self, stage_name: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.stage_name.as_deref() == Some(stage_name))
            .map(|n| n.name.as_str())
            .collect()
    }
}

/// Fluent, single-threaded builder for a [`PlanTemplate`].
///
/// # Examples
///
/// ```
/// use rockestra::blueprint::{BlueprintBuilder, StageContract};
///
/// let template = BlueprintBuilder::new("recommend_home")
///     .step("load_profile", "ProfileLoader")
///     .stage("candidates", StageContract::default())
///     .join("merge", "rockestra::demo::MergedCandidates")
///     .build()
///     .unwrap();
///
/// assert_eq!(template.nodes.len(), 2);
/// ```
pub struct BlueprintBuilder {
    flow_name: String,
    nodes: Vec<BlueprintNode>,
    stage_contracts: FxHashMap<String, StageContract>,
    seen_stage_names: HashSet<String>,
    /// Every name passed to `stage()`, in call order, including repeats —
    /// `seen_stage_names` alone can't tell `build()` a name was declared
    /// twice since the second `insert` is a silent no-op.
    stage_declarations: Vec<String>,
    current_stage: Option<String>,
}

impl BlueprintBuilder {
    pub fn new(flow_name: impl Into<String>) -> Self {
        Self {
            flow_name: flow_name.into(),
            nodes: Vec::new(),
            stage_contracts: FxHashMap::default(),
            seen_stage_names: HashSet::new(),
            stage_declarations: Vec::new(),
            current_stage: None,
        }
    }

    /// Opens a named stage; every `step`/`join` call until the next `stage`
    /// (or `end_stage`) call is attached to it. Re-declaring a name already
    /// used by an earlier `stage()` call is rejected by `build()`.
    pub fn stage(mut self, name: impl Into<String>, contract: StageContract) -> Self {
        let name = name.into();
        self.stage_declarations.push(name.clone());
        self.seen_stage_names.insert(name.clone());
        self.stage_contracts.insert(name.clone(), contract);
        self.current_stage = Some(name);
        self
    }

    /// Closes the currently open stage; subsequent nodes are top-level.
    pub fn end_stage(mut self) -> Self {
        self.current_stage = None;
        self
    }

    pub fn step(mut self, name: impl Into<String>, module_type: impl Into<String>) -> Self {
        self.nodes.push(BlueprintNode {
            kind: NodeKind::Step,
            name: name.into(),
            stage_name: self.current_stage.clone(),
            module_type: Some(module_type.into()),
            join_output_type: None,
        });
        self
    }

    pub fn join(
        mut self,
        name: impl Into<String>,
        join_output_type: impl Into<JoinOutputFingerprint>,
    ) -> Self {
        self.nodes.push(BlueprintNode {
            kind: NodeKind::Join,
            name: name.into(),
            stage_name: self.current_stage.clone(),
            module_type: None,
            join_output_type: Some(join_output_type.into()),
        });
        self
    }

    pub fn build(self) -> Result<PlanTemplate, BlueprintError> {
        if self.flow_name.is_empty() {
            return Err(BlueprintError::EmptyFlowName);
        }
        if self.nodes.is_empty() {
            return Err(BlueprintError::EmptyBlueprint);
        }

        let mut seen = HashSet::with_capacity(self.stage_declarations.len());
        for name in &self.stage_declarations {
            if !seen.insert(name.clone()) {
                return Err(BlueprintError::DuplicateStageName(name.clone()));
            }
        }

        let mut node_name_to_index = FxHashMap::default();
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.name.is_empty() {
                return Err(BlueprintError::EmptyNodeName);
            }
            if node_name_to_index.insert(node.name.clone(), idx).is_some() {
                return Err(BlueprintError::DuplicateNodeName(node.name.clone()));
            }
        }

        for stage_name in &self.seen_stage_names {
            let has_node = self
                .nodes
                .iter()
                .any(|n| n.stage_name.as_deref() == Some(stage_name.as_str()));
            if !has_node {
                return Err(BlueprintError::EmptyStage(stage_name.clone()));
            }
        }

        let plan_hash = hash::plan_hash(&self.flow_name, &self.nodes);

        Ok(PlanTemplate {
            flow_name: self.flow_name,
            nodes: self.nodes,
            node_name_to_index,
            stage_contracts: self.stage_contracts,
            plan_hash,
        })
    }
}
