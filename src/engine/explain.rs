//! Structured per-request trace (§3, §4.8, §6). Reset fresh by every
//! `ExecutionEngine::execute` call — never accumulated across runs.

use crate::outcome::OutcomeKind;
use crate::patch::OverlayLayer;
use crate::planner::SkipReason;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct NodeTrace {
    pub name: String,
    pub outcome_kind: Option<OutcomeKind>,
    pub outcome_code: Option<String>,
    #[serde(skip)]
    pub start: Option<Instant>,
    #[serde(skip)]
    pub end: Option<Instant>,
    pub duration_ticks: u64,
}

impl NodeTrace {
    fn unexecuted(name: String) -> Self {
        Self {
            name,
            outcome_kind: None,
            outcome_code: None,
            start: None,
            end: None,
            duration_ticks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDecisionTrace {
    pub module_id: String,
    pub kept: bool,
    pub reason_code: Option<String>,
    pub gate_decision_code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTrace {
    pub stage_name: String,
    pub decisions: Vec<ModuleDecisionTrace>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverlayTrace {
    pub layer: OverlayLayer,
    pub experiment_layer: Option<String>,
    pub experiment_variant: Option<String>,
}

/// Fresh per `execute` call: `nodes` sized to the plan's node count up
/// front, everything else empty until the corresponding step runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecExplain {
    pub nodes: Vec<NodeTrace>,
    pub stages: Vec<StageTrace>,
    pub overlays_applied: Vec<OverlayTrace>,
    pub qos_selected_tier: Option<String>,
    pub config_lkg_fallback: bool,
}

impl ExecExplain {
    pub fn new(node_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            nodes: node_names.into_iter().map(NodeTrace::unexecuted).collect(),
            stages: Vec::new(),
            overlays_applied: Vec::new(),
            qos_selected_tier: None,
            config_lkg_fallback: false,
        }
    }

    pub fn record_node_start(&mut self, name: &str, at: Instant) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.name == name) {
            node.start = Some(at);
        }
    }

    pub fn record_node_end(
        &mut self,
        name: &str,
        at: Instant,
        kind: OutcomeKind,
        code: impl Into<String>,
    ) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.name == name) {
            node.end = Some(at);
            node.outcome_kind = Some(kind);
            node.outcome_code = Some(code.into());
            if let (Some(start), Some(end)) = (node.start, node.end) {
                node.duration_ticks = end.saturating_duration_since(start).as_nanos() as u64;
            }
        }
    }

    pub fn record_stage(&mut self, stage_name: &str, snapshot: &crate::planner::StageFanoutSnapshot) {
        let mut decisions = Vec::new();
        for module in &snapshot.primary {
            decisions.push(ModuleDecisionTrace {
                module_id: module.id.clone(),
                kept: true,
                reason_code: None,
                gate_decision_code: module.gate_decision.as_ref().map(|d| d.code().to_string()),
            });
        }
        for module in &snapshot.shadow {
            decisions.push(ModuleDecisionTrace {
                module_id: module.id.clone(),
                kept: true,
                reason_code: None,
                gate_decision_code: module.gate_decision.as_ref().map(|d| d.code().to_string()),
            });
        }
        for skipped in &snapshot.skipped {
            decisions.push(ModuleDecisionTrace {
                module_id: skipped.id.clone(),
                kept: false,
                reason_code: Some(skip_reason_code(&skipped.reason)),
                gate_decision_code: None,
            });
        }
        self.stages.push(StageTrace {
            stage_name: stage_name.to_string(),
            decisions,
        });
    }

    pub fn record_overlays(&mut self, overlays: &[crate::patch::OverlayApplied]) {
        self.overlays_applied = overlays
            .iter()
            .map(|o| OverlayTrace {
                layer: o.layer,
                experiment_layer: o.experiment_layer.clone(),
                experiment_variant: o.experiment_variant.clone(),
            })
            .collect();
    }
}

fn skip_reason_code(reason: &SkipReason) -> String {
    reason.code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unexecuted_node_keeps_zero_duration_and_no_outcome() {
        let explain = ExecExplain::new(["a".to_string()]);
        let node = &explain.nodes[0];
        assert_eq!(node.outcome_kind, None);
        assert_eq!(node.duration_ticks, 0);
    }

    #[test]
    fn executed_node_duration_matches_end_minus_start() {
        let mut explain = ExecExplain::new(["a".to_string()]);
        let start = Instant::now();
        explain.record_node_start("a", start);
        let end = start + Duration::from_millis(5);
        explain.record_node_end("a", end, OutcomeKind::Ok, "OK");
        let node = &explain.nodes[0];
        assert_eq!(node.duration_ticks, end.duration_since(start).as_nanos() as u64);
    }
}
