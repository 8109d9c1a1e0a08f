//! Tracing instrumentation (§6): span/event helpers the engine and planner
//! call at module and stage boundaries, built around
//! `tracing::info_span!`/`instrument` at per-module and per-stage
//! granularity.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the process-wide tracing subscriber for a host binary embedding
/// this crate: an env-filtered fmt layer plus [`ErrorLayer`] so
/// `miette`/`tracing_error::SpanTrace` captures line up with the active
/// span stack. Loads a `.env` file first via `dotenvy` so `RUST_LOG` can be
/// set alongside other process configuration. Safe to call more than once;
/// only the first call installs a subscriber.
pub fn init_tracing() {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{TRACE_TARGET}=info")));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(filter)
        .with(ErrorLayer::default())
        .try_init();
}

/// Source name attached to every span this crate emits.
pub const TRACE_TARGET: &str = "rockestra";

pub const METRIC_MODULE_LATENCY_MS: &str = "rockestra.stage.fanout.module.latency.ms";
pub const METRIC_MODULE_OUTCOMES: &str = "rockestra.stage.fanout.module.outcomes";
pub const METRIC_MODULE_SKIPPED_REASONS: &str = "rockestra.stage.fanout.module.skipped.reasons";

/// Opens a span for one module invocation within a stage fan-out.
pub fn module_span(flow_name: &str, stage_name: &str, module_id: &str, use_type: &str) -> tracing::Span {
    tracing::info_span!(
        target: TRACE_TARGET,
        "module_execute",
        flow = flow_name,
        stage = stage_name,
        module_id,
        use_type,
    )
}

/// Opens a span for one stage's fan-out planning + execution.
pub fn stage_span(flow_name: &str, stage_name: &str) -> tracing::Span {
    tracing::info_span!(target: TRACE_TARGET, "stage_fanout", flow = flow_name, stage = stage_name)
}

pub fn record_module_outcome(
    flow_name: &str,
    stage_name: &str,
    module_id: &str,
    outcome_code: &str,
    duration_ms: u64,
) {
    tracing::info!(
        target: TRACE_TARGET,
        metric = METRIC_MODULE_LATENCY_MS,
        flow = flow_name,
        stage = stage_name,
        module_id,
        outcome_code,
        duration_ms,
        "module execution finished"
    );
}

pub fn record_module_skipped(flow_name: &str, stage_name: &str, module_id: &str, reason_code: &str) {
    tracing::info!(
        target: TRACE_TARGET,
        metric = METRIC_MODULE_SKIPPED_REASONS,
        flow = flow_name,
        stage = stage_name,
        module_id,
        reason_code,
        "module skipped"
    );
}

pub fn record_lkg_fallback(flow_name: &str) {
    tracing::warn!(
        target: TRACE_TARGET,
        flow = flow_name,
        "config snapshot served from last-known-good fallback"
    );
}
