//! Stage fan-out planning (§4.7): turns an effective stage's module list
//! into a primary set, a shadow set, and a fully ordered skip trace.

use crate::blueprint::StageContract;
use crate::bulkhead::{Bulkhead, BulkheadPermit};
use crate::context::FlowContext;
use crate::fnv::fnv1a_64;
use crate::gate::{self, GateDecision};
use crate::patch::{EffectiveModule, EffectiveStage};
use crate::selectors::SelectorRegistry;
use serde_json::Value;

/// Why a candidate module did not make it into the primary or shadow set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DynamicModulesForbidden,
    ModuleTypeForbidden,
    Disabled,
    GateFalse { reason_code: String },
    ShadowForbidden,
    ShadowNotSampled,
    MaxModulesHardExceeded,
    MaxShadowModulesHardExceeded,
    FanoutTrim,
    BulkheadRejected,
}

impl SkipReason {
    pub fn code(&self) -> String {
        match self {
            SkipReason::DynamicModulesForbidden => {
                "STAGE_CONTRACT_DYNAMIC_MODULES_FORBIDDEN".to_string()
            }
            SkipReason::ModuleTypeForbidden => "STAGE_CONTRACT_MODULE_TYPE_FORBIDDEN".to_string(),
            SkipReason::Disabled => "DISABLED".to_string(),
            SkipReason::GateFalse { reason_code } => format!("GATE_FALSE:{reason_code}"),
            SkipReason::ShadowForbidden => "STAGE_CONTRACT_SHADOW_FORBIDDEN".to_string(),
            SkipReason::ShadowNotSampled => "SHADOW_NOT_SAMPLED".to_string(),
            SkipReason::MaxModulesHardExceeded => {
                "STAGE_CONTRACT_MAX_MODULES_HARD_EXCEEDED".to_string()
            }
            SkipReason::MaxShadowModulesHardExceeded => {
                "STAGE_CONTRACT_MAX_SHADOW_MODULES_HARD_EXCEEDED".to_string()
            }
            SkipReason::FanoutTrim => "FANOUT_TRIM".to_string(),
            SkipReason::BulkheadRejected => "BULKHEAD_REJECTED".to_string(),
        }
    }
}

/// A module admitted into the primary or shadow set, holding the bulkhead
/// permit (if any) for the lifetime of its execution.
pub struct PlannedModule {
    pub id: String,
    pub use_type: String,
    pub with: Value,
    pub limit_key: Option<String>,
    pub gate_decision: Option<GateDecision>,
    permit: Option<BulkheadPermit>,
}

impl Clone for PlannedModule {
    /// Clones the planning metadata. The bulkhead permit is NOT duplicated
    /// (a clone never re-occupies the slot); only the original planner
    /// output should be used to drive execution.
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            use_type: self.use_type.clone(),
            with: self.with.clone(),
            limit_key: self.limit_key.clone(),
            gate_decision: self.gate_decision.clone(),
            permit: None,
        }
    }
}

impl std::fmt::Debug for PlannedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedModule")
            .field("id", &self.id)
            .field("use_type", &self.use_type)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SkippedModule {
    pub id: String,
    pub reason: SkipReason,
}

/// Planner output for one stage, attached to the request's [`FlowContext`]
/// so join nodes can see which modules actually ran.
#[derive(Debug, Default)]
pub struct StageFanoutSnapshot {
    pub primary: Vec<PlannedModule>,
    pub shadow: Vec<PlannedModule>,
    pub skipped: Vec<SkippedModule>,
}

impl Clone for StageFanoutSnapshot {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.iter().map(PlannedModule::clone).collect(),
            shadow: self.shadow.iter().map(PlannedModule::clone).collect(),
            skipped: self.skipped.clone(),
        }
    }
}

impl StageFanoutSnapshot {
    pub fn enabled_module_ids(&self) -> Vec<&str> {
        self.primary.iter().map(|m| m.id.as_str()).collect()
    }
}

struct Candidate {
    module: EffectiveModule,
    gate_decision: Option<GateDecision>,
    input_order: usize,
}

pub struct StageFanoutPlanner;

impl StageFanoutPlanner {
    pub fn plan(
        stage: &EffectiveStage,
        contract: &StageContract,
        ctx: &FlowContext,
        selectors: &SelectorRegistry,
        bulkhead: &Bulkhead,
        flow_name: &str,
    ) -> StageFanoutSnapshot {
        let mut skipped = Vec::new();

        // 1. dynamic-modules gate
        if !contract.allow_dynamic_modules {
            for module in &stage.modules {
                skipped.push(SkippedModule {
                    id: module.id.clone(),
                    reason: SkipReason::DynamicModulesForbidden,
                });
            }
            return StageFanoutSnapshot {
                primary: Vec::new(),
                shadow: Vec::new(),
                skipped,
            };
        }

        let mut primary_candidates: Vec<Candidate> = Vec::new();
        let mut shadow_candidates: Vec<Candidate> = Vec::new();

        for (input_order, module) in stage.modules.iter().enumerate() {
            // 2. module-type allowlist
            if let Some(allowed) = &contract.allowed_module_types {
                if !allowed.contains(&module.use_type) {
                    skipped.push(SkippedModule {
                        id: module.id.clone(),
                        reason: SkipReason::ModuleTypeForbidden,
                    });
                    continue;
                }
            }

            // 3. enabled filter
            if !module.enabled {
                skipped.push(SkippedModule {
                    id: module.id.clone(),
                    reason: SkipReason::Disabled,
                });
                continue;
            }

            // 4. gate evaluation
            let gate_decision = module
                .gate
                .as_ref()
                .map(|gate| gate::evaluate(gate, ctx, selectors));
            if let Some(decision) = &gate_decision {
                if !decision.allowed {
                    skipped.push(SkippedModule {
                        id: module.id.clone(),
                        reason: SkipReason::GateFalse {
                            reason_code: decision.reason_code.clone(),
                        },
                    });
                    continue;
                }
            }

            // 5. shadow contract
            if module.shadow_sample_bps > 0 {
                if !contract.allow_shadow {
                    skipped.push(SkippedModule {
                        id: module.id.clone(),
                        reason: SkipReason::ShadowForbidden,
                    });
                    continue;
                }
                let effective_bps = module.shadow_sample_bps.min(contract.max_shadow_sample_bps);
                if !shadow_is_sampled(effective_bps, flow_name, &module.id, ctx.user_id.as_deref())
                {
                    skipped.push(SkippedModule {
                        id: module.id.clone(),
                        reason: SkipReason::ShadowNotSampled,
                    });
                    continue;
                }
                shadow_candidates.push(Candidate {
                    module: module.clone(),
                    gate_decision,
                    input_order,
                });
                continue;
            }

            primary_candidates.push(Candidate {
                module: module.clone(),
                gate_decision,
                input_order,
            });
        }

        // 6. fanoutMax clamp
        let effective_fanout = stage
            .fanout_max
            .unwrap_or(contract.fanout_max_range.max)
            .clamp(contract.fanout_max_range.min, contract.fanout_max_range.max);

        // 7. hard module cap
        let (primary_candidates, overflow) =
            split_top_n(primary_candidates, contract.max_modules_hard as usize);
        push_skips(&mut skipped, overflow, SkipReason::MaxModulesHardExceeded);

        let (shadow_candidates, shadow_overflow) =
            split_top_n(shadow_candidates, contract.max_shadow_modules as usize);
        push_skips(
            &mut skipped,
            shadow_overflow,
            SkipReason::MaxShadowModulesHardExceeded,
        );

        // 8. fanout trim by priority (primary only)
        let (primary_candidates, trimmed) = split_top_n(primary_candidates, effective_fanout as usize);
        push_skips(&mut skipped, trimmed, SkipReason::FanoutTrim);

        // 9. bulkhead admission
        let primary = admit_all(primary_candidates, bulkhead, &mut skipped);
        let shadow = admit_all(shadow_candidates, bulkhead, &mut skipped);

        StageFanoutSnapshot {
            primary,
            shadow,
            skipped,
        }
    }
}

/// Sorts by `(priority desc, input_order asc)` and splits into the top `n`
/// kept candidates and the remainder, preserving the sorted order of the
/// kept half (§4.7 steps 7 and 8 share this exact algorithm).
fn split_top_n(mut candidates: Vec<Candidate>, n: usize) -> (Vec<Candidate>, Vec<Candidate>) {
    candidates.sort_by(|a, b| {
        b.module
            .priority
            .cmp(&a.module.priority)
            .then(a.input_order.cmp(&b.input_order))
    });
    if candidates.len() <= n {
        (candidates, Vec::new())
    } else {
        let overflow = candidates.split_off(n);
        (candidates, overflow)
    }
}

fn push_skips(skipped: &mut Vec<SkippedModule>, overflow: Vec<Candidate>, reason: SkipReason) {
    for candidate in overflow {
        skipped.push(SkippedModule {
            id: candidate.module.id,
            reason: reason.clone(),
        });
    }
}

fn admit_all(
    candidates: Vec<Candidate>,
    bulkhead: &Bulkhead,
    skipped: &mut Vec<SkippedModule>,
) -> Vec<PlannedModule> {
    let mut admitted = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        // Bulkhead admission only applies to a module that opted into a
        // `limit_key` (§4.7 step 9). A module with none bypasses admission
        // entirely rather than being folded into a limit keyed by its
        // `use_type`, which could collide with an unrelated operator limit.
        let Some(key) = candidate.module.limit_key.clone() else {
            admitted.push(PlannedModule {
                id: candidate.module.id,
                use_type: candidate.module.use_type,
                with: candidate.module.with,
                limit_key: candidate.module.limit_key,
                gate_decision: candidate.gate_decision,
                permit: None,
            });
            continue;
        };
        match bulkhead.try_admit(&key) {
            Some(permit) => admitted.push(PlannedModule {
                id: candidate.module.id,
                use_type: candidate.module.use_type,
                with: candidate.module.with,
                limit_key: candidate.module.limit_key,
                gate_decision: candidate.gate_decision,
                permit: Some(permit),
            }),
            None => skipped.push(SkippedModule {
                id: candidate.module.id,
                reason: SkipReason::BulkheadRejected,
            }),
        }
    }
    admitted
}

/// Deterministic shadow sampling draw, seeded by `(flow_name, module_id, user_id)`
/// so retries of the same request land on the same sample decision (§4.7 step 5).
fn shadow_is_sampled(sample_bps: u32, flow_name: &str, module_id: &str, user_id: Option<&str>) -> bool {
    if sample_bps == 0 {
        return false;
    }
    if sample_bps >= 10_000 {
        return true;
    }
    let seed = format!("{flow_name}\0{module_id}\0{}", user_id.unwrap_or(""));
    let draw = fnv1a_64(seed.as_bytes()) % 10_000;
    draw < u64::from(sample_bps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::FanoutRange;
    use proptest::prelude::*;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> FlowContext {
        FlowContext::new(
            Default::default(),
            None,
            Default::default(),
            CancellationToken::new(),
            Instant::now() + Duration::from_secs(1),
        )
        .unwrap()
    }

    fn module(id: &str, priority: i32) -> EffectiveModule {
        EffectiveModule {
            id: id.to_string(),
            use_type: "Demo".to_string(),
            with: Value::Object(Default::default()),
            priority,
            enabled: true,
            gate: None,
            shadow_sample_bps: 0,
            limit_key: None,
        }
    }

    #[test]
    fn dynamic_modules_forbidden_skips_everything() {
        let stage = EffectiveStage {
            modules: vec![module("m1", 0)],
            fanout_max: None,
        };
        let contract = StageContract {
            allow_dynamic_modules: false,
            ..StageContract::default()
        };
        let snapshot = StageFanoutPlanner::plan(
            &stage,
            &contract,
            &ctx(),
            &SelectorRegistry::empty(),
            &Bulkhead::new(),
            "flow",
        );
        assert!(snapshot.primary.is_empty());
        assert_eq!(snapshot.skipped.len(), 1);
        assert_eq!(
            snapshot.skipped[0].reason,
            SkipReason::DynamicModulesForbidden
        );
    }

    #[test]
    fn fanout_trim_keeps_highest_priority_first() {
        let stage = EffectiveStage {
            modules: vec![module("low", 1), module("high", 5), module("mid", 3)],
            fanout_max: Some(2),
        };
        let contract = StageContract {
            allow_dynamic_modules: true,
            fanout_max_range: FanoutRange { min: 0, max: 10 },
            max_modules_hard: 10,
            ..StageContract::default()
        };
        let snapshot = StageFanoutPlanner::plan(
            &stage,
            &contract,
            &ctx(),
            &SelectorRegistry::empty(),
            &Bulkhead::new(),
            "flow",
        );
        assert_eq!(snapshot.enabled_module_ids(), vec!["high", "mid"]);
        assert_eq!(
            snapshot.skipped.iter().find(|s| s.id == "low").unwrap().reason,
            SkipReason::FanoutTrim
        );
    }

    #[test]
    fn zero_sample_shadow_is_never_sampled() {
        let mut m = module("shadow1", 0);
        m.shadow_sample_bps = 0;
        assert!(!shadow_is_sampled(0, "flow", "shadow1", None));
        let _ = m;
    }

    #[test]
    fn bulkhead_rejection_skips_with_bulkhead_reason() {
        let stage = EffectiveStage {
            modules: vec![{
                let mut m = module("m1", 0);
                m.limit_key = Some("shared".to_string());
                m
            }],
            fanout_max: None,
        };
        let contract = StageContract {
            allow_dynamic_modules: true,
            ..StageContract::default()
        };
        let bulkhead = Bulkhead::new();
        let mut limits = rustc_hash::FxHashMap::default();
        limits.insert("shared".to_string(), 0);
        bulkhead.set_limits(limits);
        let snapshot = StageFanoutPlanner::plan(
            &stage,
            &contract,
            &ctx(),
            &SelectorRegistry::empty(),
            &bulkhead,
            "flow",
        );
        assert!(snapshot.primary.is_empty());
        assert_eq!(snapshot.skipped[0].reason, SkipReason::BulkheadRejected);
    }

    #[test]
    fn a_module_with_no_limit_key_bypasses_the_bulkhead() {
        let stage = EffectiveStage {
            modules: vec![module("m1", 0)],
            fanout_max: None,
        };
        let contract = StageContract {
            allow_dynamic_modules: true,
            ..StageContract::default()
        };
        let bulkhead = Bulkhead::new();
        // A limit keyed by the module's own `use_type` must not throttle a
        // module that never opted into `limit_key`.
        let mut limits = rustc_hash::FxHashMap::default();
        limits.insert("Demo".to_string(), 0);
        bulkhead.set_limits(limits);
        let snapshot = StageFanoutPlanner::plan(
            &stage,
            &contract,
            &ctx(),
            &SelectorRegistry::empty(),
            &bulkhead,
            "flow",
        );
        assert_eq!(snapshot.enabled_module_ids(), vec!["m1"]);
        assert!(snapshot.skipped.is_empty());
    }

    proptest! {
        #[test]
        fn every_candidate_is_either_admitted_or_skipped_exactly_once(
            priorities in proptest::collection::vec(-100i32..100i32, 0..12),
            fanout_max in 0u32..12,
        ) {
            let modules: Vec<EffectiveModule> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| module(&format!("m{i}"), *p))
                .collect();
            let total = modules.len();
            let stage = EffectiveStage {
                modules,
                fanout_max: Some(fanout_max),
            };
            let contract = StageContract {
                allow_dynamic_modules: true,
                fanout_max_range: FanoutRange { min: 0, max: 12 },
                max_modules_hard: 12,
                ..StageContract::default()
            };
            let snapshot = StageFanoutPlanner::plan(
                &stage,
                &contract,
                &ctx(),
                &SelectorRegistry::empty(),
                &Bulkhead::new(),
                "flow",
            );
            prop_assert_eq!(snapshot.primary.len() + snapshot.shadow.len() + snapshot.skipped.len(), total);
            prop_assert!(snapshot.primary.len() <= fanout_max as usize);
        }
    }
}
