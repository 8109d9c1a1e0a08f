//! The overlay resolver (§4.6): turns `(flow_name, patch_json,
//! request_options, qos_tier)` into an effective per-stage module list,
//! merged params, and an ordered overlay trace.

mod merge;

pub use merge::{canonical_string, params_hash, sample_to_bps};

use crate::gate::GateNode;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Schema v1 wire format (§6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatchDocument {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    pub flows: FxHashMap<String, FlowPatch>,
    #[serde(default)]
    pub limits: Option<LimitsBlock>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlowPatch {
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub stages: FxHashMap<String, StagePatch>,
    #[serde(default)]
    pub experiments: Vec<ExperimentEntry>,
    #[serde(default)]
    pub qos: Option<QosBlock>,
    #[serde(default)]
    pub emergency: Option<EmergencyBlock>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StagePatch {
    #[serde(rename = "fanoutMax", default)]
    pub fanout_max: Option<u32>,
    #[serde(default)]
    pub modules: Vec<ModulePatch>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModulePatch {
    pub id: String,
    #[serde(rename = "use", default)]
    pub use_type: Option<String>,
    #[serde(default)]
    pub with: Option<Value>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub gate: Option<GateNode>,
    #[serde(default)]
    pub shadow: Option<ShadowPatch>,
    #[serde(rename = "limitKey", default)]
    pub limit_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShadowPatch {
    pub sample: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentEntry {
    pub layer: String,
    pub variant: String,
    pub patch: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QosBlock {
    pub tiers: FxHashMap<String, QosTierPatch>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QosTierPatch {
    pub patch: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmergencyBlock {
    pub reason: String,
    pub operator: String,
    pub ttl_minutes: i64,
    pub patch: Value,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LimitsBlock {
    #[serde(rename = "moduleConcurrency", default)]
    pub module_concurrency: ModuleConcurrencyLimits,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModuleConcurrencyLimits {
    #[serde(rename = "maxInFlight", default)]
    pub max_in_flight: FxHashMap<String, u32>,
}

/// QoS tier selection; `Full` never applies a qos overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosTier {
    Full,
    Conserve,
    Emergency,
}

impl QosTier {
    fn key(self) -> Option<&'static str> {
        match self {
            QosTier::Full => None,
            QosTier::Conserve => Some("conserve"),
            QosTier::Emergency => Some("emergency"),
        }
    }
}

/// Caller-scoped request facets used by both gate evaluation and overlay
/// selection.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub variants: FxHashMap<String, String>,
    pub user_id: Option<String>,
    pub request_attributes: FxHashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayLayer {
    Default,
    Base,
    Experiment,
    Qos,
    Emergency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayApplied {
    pub layer: OverlayLayer,
    pub experiment_layer: Option<String>,
    pub experiment_variant: Option<String>,
}

/// One module as it stands after every applicable overlay has been merged
/// into it, in final declared order (ties broken by stable insertion).
#[derive(Debug, Clone)]
pub struct EffectiveModule {
    pub id: String,
    pub use_type: String,
    pub with: Value,
    pub priority: i32,
    pub enabled: bool,
    pub gate: Option<GateNode>,
    pub shadow_sample_bps: u32,
    pub limit_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EffectiveStage {
    pub modules: Vec<EffectiveModule>,
    pub fanout_max: Option<u32>,
}

/// The resolved, per-request effective plan: per-stage modules, merged
/// params, and the ordered overlay trace.
#[derive(Debug, Clone)]
pub struct PatchEvaluation {
    pub flow_name: String,
    pub stages: FxHashMap<String, EffectiveStage>,
    pub params: Value,
    pub params_hash: u64,
    pub params_source: FxHashMap<String, OverlayLayer>,
    pub overlays_applied: Vec<OverlayApplied>,
    pub qos_selected_tier: QosTier,
}

#[derive(Debug, Error, miette::Diagnostic)]
pub enum PatchError {
    #[error("patch document declares unsupported schema version {0:?}")]
    #[diagnostic(code(rockestra::patch::unsupported_schema_version))]
    UnsupportedSchemaVersion(String),
}

/// Stateless overlay resolver: `evaluate` is a pure function of its inputs
/// and is safe to call from many concurrent requests.
pub struct PatchEvaluator;

impl PatchEvaluator {
    pub fn evaluate(
        flow_name: &str,
        patch: &PatchDocument,
        default_params: Option<&Value>,
        request: &RequestOptions,
        qos_tier: QosTier,
    ) -> Result<PatchEvaluation, PatchError> {
        if patch.schema_version != "v1" {
            return Err(PatchError::UnsupportedSchemaVersion(
                patch.schema_version.clone(),
            ));
        }

        let mut params = Value::Object(Default::default());
        let mut params_source = FxHashMap::default();
        let mut overlays_applied = Vec::new();
        let mut stage_orders: FxHashMap<String, Vec<String>> = FxHashMap::default();
        let mut stage_modules: FxHashMap<String, FxHashMap<String, ModulePatch>> =
            FxHashMap::default();
        let mut stage_fanout_max: FxHashMap<String, u32> = FxHashMap::default();

        let empty_flow_patch = FlowPatch::default();
        let flow_patch = patch.flows.get(flow_name).unwrap_or(&empty_flow_patch);

        // 1. default
        if let Some(defaults) = default_params {
            merge::merge_layer(&mut params, defaults, OverlayLayer::Default, &mut params_source);
            overlays_applied.push(OverlayApplied {
                layer: OverlayLayer::Default,
                experiment_layer: None,
                experiment_variant: None,
            });
        }

        // 2. base
        if let Some(base_params) = &flow_patch.params {
            merge::merge_layer(&mut params, base_params, OverlayLayer::Base, &mut params_source);
        }
        for (stage_name, stage_patch) in &flow_patch.stages {
            apply_stage_patch(
                stage_name,
                stage_patch,
                &mut stage_orders,
                &mut stage_modules,
                &mut stage_fanout_max,
            );
        }
        if flow_patch.params.is_some() || !flow_patch.stages.is_empty() {
            overlays_applied.push(OverlayApplied {
                layer: OverlayLayer::Base,
                experiment_layer: None,
                experiment_variant: None,
            });
        }

        // 3. experiment
        for entry in &flow_patch.experiments {
            let matches = request
                .variants
                .get(&entry.layer)
                .is_some_and(|v| v == &entry.variant);
            if !matches {
                continue;
            }
            let experiment_patch: FlowPatch =
                serde_json::from_value(entry.patch.clone()).unwrap_or_default();
            if let Some(p) = &experiment_patch.params {
                merge::merge_layer(&mut params, p, OverlayLayer::Experiment, &mut params_source);
            }
            for (stage_name, stage_patch) in &experiment_patch.stages {
                apply_stage_patch(
                    stage_name,
                    stage_patch,
                    &mut stage_orders,
                    &mut stage_modules,
                    &mut stage_fanout_max,
                );
            }
            overlays_applied.push(OverlayApplied {
                layer: OverlayLayer::Experiment,
                experiment_layer: Some(entry.layer.clone()),
                experiment_variant: Some(entry.variant.clone()),
            });
        }

        // 4. qos
        if let (Some(tier_key), Some(qos_block)) = (qos_tier.key(), &flow_patch.qos) {
            if let Some(tier_patch) = qos_block.tiers.get(tier_key) {
                let qos_patch: FlowPatch =
                    serde_json::from_value(tier_patch.patch.clone()).unwrap_or_default();
                if let Some(p) = &qos_patch.params {
                    merge::merge_layer(&mut params, p, OverlayLayer::Qos, &mut params_source);
                }
                for (stage_name, stage_patch) in &qos_patch.stages {
                    apply_stage_patch(
                        stage_name,
                        stage_patch,
                        &mut stage_orders,
                        &mut stage_modules,
                        &mut stage_fanout_max,
                    );
                }
                overlays_applied.push(OverlayApplied {
                    layer: OverlayLayer::Qos,
                    experiment_layer: None,
                    experiment_variant: None,
                });
            }
        }

        // 5. emergency
        if let Some(emergency) = &flow_patch.emergency {
            let emergency_patch: FlowPatch =
                serde_json::from_value(emergency.patch.clone()).unwrap_or_default();
            if let Some(p) = &emergency_patch.params {
                merge::merge_layer(&mut params, p, OverlayLayer::Emergency, &mut params_source);
            }
            for (stage_name, stage_patch) in &emergency_patch.stages {
                apply_stage_patch(
                    stage_name,
                    stage_patch,
                    &mut stage_orders,
                    &mut stage_modules,
                    &mut stage_fanout_max,
                );
            }
            overlays_applied.push(OverlayApplied {
                layer: OverlayLayer::Emergency,
                experiment_layer: None,
                experiment_variant: None,
            });
        }

        let mut stages = FxHashMap::default();
        for (stage_name, order) in &stage_orders {
            let modules_by_id = &stage_modules[stage_name];
            let modules = order
                .iter()
                .map(|id| effective_module(&modules_by_id[id]))
                .collect();
            stages.insert(
                stage_name.clone(),
                EffectiveStage {
                    modules,
                    fanout_max: stage_fanout_max.get(stage_name).copied(),
                },
            );
        }

        let hash = params_hash(&params);

        Ok(PatchEvaluation {
            flow_name: flow_name.to_string(),
            stages,
            params,
            params_hash: hash,
            params_source,
            overlays_applied,
            qos_selected_tier: qos_tier,
        })
    }
}

fn apply_stage_patch(
    stage_name: &str,
    stage_patch: &StagePatch,
    stage_orders: &mut FxHashMap<String, Vec<String>>,
    stage_modules: &mut FxHashMap<String, FxHashMap<String, ModulePatch>>,
    stage_fanout_max: &mut FxHashMap<String, u32>,
) {
    if let Some(fanout_max) = stage_patch.fanout_max {
        stage_fanout_max.insert(stage_name.to_string(), fanout_max);
    }
    let order = stage_orders.entry(stage_name.to_string()).or_default();
    let modules = stage_modules.entry(stage_name.to_string()).or_default();
    for incoming in &stage_patch.modules {
        match modules.get_mut(&incoming.id) {
            Some(existing) => merge_module_patch(existing, incoming),
            None => {
                order.push(incoming.id.clone());
                modules.insert(incoming.id.clone(), incoming.clone());
            }
        }
    }
}

/// Later layer wins field-by-field; only fields actually present on
/// `incoming` overwrite `existing` (§4.6: "updates only the fields it carries").
fn merge_module_patch(existing: &mut ModulePatch, incoming: &ModulePatch) {
    if incoming.use_type.is_some() {
        existing.use_type = incoming.use_type.clone();
    }
    if incoming.with.is_some() {
        existing.with = incoming.with.clone();
    }
    if incoming.enabled.is_some() {
        existing.enabled = incoming.enabled;
    }
    if incoming.priority.is_some() {
        existing.priority = incoming.priority;
    }
    if incoming.gate.is_some() {
        existing.gate = incoming.gate.clone();
    }
    if incoming.shadow.is_some() {
        existing.shadow = incoming.shadow.clone();
    }
    if incoming.limit_key.is_some() {
        existing.limit_key = incoming.limit_key.clone();
    }
}

fn effective_module(patch: &ModulePatch) -> EffectiveModule {
    EffectiveModule {
        id: patch.id.clone(),
        use_type: patch.use_type.clone().unwrap_or_default(),
        with: patch.with.clone().unwrap_or(Value::Object(Default::default())),
        priority: patch.priority.unwrap_or(0),
        enabled: patch.enabled.unwrap_or(true),
        gate: patch.gate.clone(),
        shadow_sample_bps: patch.shadow.as_ref().map(|s| sample_to_bps(s.sample)).unwrap_or(0),
        limit_key: patch.limit_key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(flows: Value) -> PatchDocument {
        serde_json::from_value(json!({
            "schemaVersion": "v1",
            "flows": flows,
        }))
        .unwrap()
    }

    #[test]
    fn qos_overlay_appears_after_base_and_before_emergency() {
        let patch = doc(json!({
            "demo": {
                "params": {"a": 1},
                "qos": {"tiers": {"emergency": {"patch": {"params": {"a": 2}}}}},
                "emergency": {"reason": "r", "operator": "op", "ttl_minutes": 5, "patch": {"params": {"a": 3}}},
            }
        }));
        let evaluation = PatchEvaluator::evaluate(
            "demo",
            &patch,
            None,
            &RequestOptions::default(),
            QosTier::Emergency,
        )
        .unwrap();
        let layers: Vec<OverlayLayer> = evaluation.overlays_applied.iter().map(|o| o.layer).collect();
        let qos_idx = layers.iter().position(|l| *l == OverlayLayer::Qos).unwrap();
        let base_idx = layers.iter().position(|l| *l == OverlayLayer::Base).unwrap();
        let emergency_idx = layers.iter().position(|l| *l == OverlayLayer::Emergency).unwrap();
        assert!(base_idx < qos_idx);
        assert!(qos_idx < emergency_idx);
    }

    #[test]
    fn module_patch_update_preserves_unspecified_fields() {
        let patch = doc(json!({
            "demo": {
                "stages": {
                    "s1": {
                        "modules": [
                            {"id": "m1", "use": "TypeA", "with": {}, "priority": 1},
                        ]
                    }
                },
                "experiments": [
                    {"layer": "l", "variant": "v", "patch": {"stages": {"s1": {"modules": [{"id": "m1", "enabled": false}]}}}},
                ],
            }
        }));
        let mut request = RequestOptions::default();
        request.variants.insert("l".into(), "v".into());
        let evaluation =
            PatchEvaluator::evaluate("demo", &patch, None, &request, QosTier::Full).unwrap();
        let stage = &evaluation.stages["s1"];
        let module = stage.modules.iter().find(|m| m.id == "m1").unwrap();
        assert_eq!(module.use_type, "TypeA");
        assert_eq!(module.priority, 1);
        assert!(!module.enabled);
    }

    #[test]
    fn params_hash_is_stable_across_key_order_permutations() {
        let a = doc(json!({"demo": {"params": {"x": 1, "y": 2}}}));
        let b = doc(json!({"demo": {"params": {"y": 2, "x": 1}}}));
        let req = RequestOptions::default();
        let ea = PatchEvaluator::evaluate("demo", &a, None, &req, QosTier::Full).unwrap();
        let eb = PatchEvaluator::evaluate("demo", &b, None, &req, QosTier::Full).unwrap();
        assert_eq!(ea.params_hash, eb.params_hash);
    }
}
