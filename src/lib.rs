//! Rockestra: a recommendation-pipeline execution engine.
//!
//! A flow is a [`blueprint::PlanTemplate`] of steps, stages, and joins.
//! Each request resolves a [`config::ConfigSnapshot`] through a provider
//! chain, evaluates it into a [`patch::PatchEvaluation`] with
//! [`patch::PatchEvaluator`], plans each stage's fan-out with
//! [`planner::StageFanoutPlanner`], and walks the plan with
//! [`engine::ExecutionEngine`]. [`host::FlowHost`] wires the pieces
//! together for one request.
//!
//! Module guide:
//! - [`fnv`] — the bit-exact FNV-1a hash used for plan hashes and rollout buckets.
//! - [`outcome`] — the `Outcome<T>` tagged result every node produces.
//! - [`blueprint`] — flow shape: nodes, stages, stage contracts, plan hash.
//! - [`module`] — the `Module` trait and its invocation context.
//! - [`context`] — per-request mutable state: node outcomes, stage snapshots, active overlay.
//! - [`catalog`] — module-type registry, lifetimes, and the singleton concurrency gate.
//! - [`selectors`] — named request predicates used by gates.
//! - [`gate`] — the gate tree and its evaluator.
//! - [`patch`] — the overlay wire format and the overlay resolver.
//! - [`planner`] — per-stage fan-out planning.
//! - [`bulkhead`] — process-wide per-key concurrency admission.
//! - [`config`] — config snapshot providers, including last-known-good fallback.
//! - [`engine`] — plan execution and the structured explain trace.
//! - [`host`] — the per-request composition root.
//! - [`validation`] — shape-only types for the external patch validator.
//! - [`telemetry`] — tracing spans and metric name constants.
//!
//! # Examples
//!
//! ```
//! use rockestra::blueprint::BlueprintBuilder;
//!
//! let template = BlueprintBuilder::new("recommend_home")
//!     .step("load_profile", "ProfileLoader")
//!     .build()
//!     .unwrap();
//! assert_eq!(template.flow_name, "recommend_home");
//! ```

pub mod blueprint;
pub mod bulkhead;
pub mod catalog;
pub mod config;
pub mod context;
pub mod engine;
pub mod fnv;
pub mod gate;
pub mod host;
pub mod module;
pub mod outcome;
pub mod patch;
pub mod planner;
pub mod selectors;
pub mod telemetry;
pub mod validation;
