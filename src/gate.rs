//! Gate tree evaluation (§4.5): pure, side-effect-free predicates deciding
//! whether a module participates in a stage's fan-out.

use crate::context::FlowContext;
use crate::fnv::fnv1a_64_utf16;
use crate::selectors::SelectorRegistry;
use serde::{Deserialize, Serialize};

/// Defensive bound on gate nesting depth. The validator is supposed to
/// reject deeper trees before they ever reach the engine (§4.5), but since
/// the validator is an external collaborator this evaluator does not
/// control, it refuses to recurse past the limit rather than trust that.
pub const MAX_GATE_DEPTH: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateNode {
    Experiment {
        layer: String,
        #[serde(rename = "in")]
        allowed_variants: Vec<String>,
    },
    All {
        children: Vec<GateNode>,
    },
    Any {
        children: Vec<GateNode>,
    },
    Not {
        child: Box<GateNode>,
    },
    Rollout {
        percent: u8,
        salt: String,
    },
    RequestAttr {
        field: String,
        #[serde(rename = "in")]
        allowed_values: Vec<String>,
    },
    Selector {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason_code: String,
}

impl GateDecision {
    fn allow(reason_code: &str) -> Self {
        Self {
            allowed: true,
            reason_code: reason_code.to_string(),
        }
    }

    fn deny(reason_code: &str) -> Self {
        Self {
            allowed: false,
            reason_code: reason_code.to_string(),
        }
    }

    /// `"GATE_TRUE"` | `"GATE_FALSE"`, per the wire contract in §4.5.
    pub fn code(&self) -> &'static str {
        if self.allowed {
            "GATE_TRUE"
        } else {
            "GATE_FALSE"
        }
    }
}

/// Evaluates a gate tree against a request context. Never panics or
/// returns an error: an unregistered selector or a tree past the depth
/// bound simply denies with a reason code.
pub fn evaluate(gate: &GateNode, ctx: &FlowContext, selectors: &SelectorRegistry) -> GateDecision {
    evaluate_at_depth(gate, ctx, selectors, 0)
}

fn evaluate_at_depth(
    gate: &GateNode,
    ctx: &FlowContext,
    selectors: &SelectorRegistry,
    depth: u32,
) -> GateDecision {
    if depth > MAX_GATE_DEPTH {
        return GateDecision::deny("GATE_DEPTH_EXCEEDED");
    }

    match gate {
        GateNode::Experiment {
            layer,
            allowed_variants,
        } => match ctx.variants.get(layer) {
            None => GateDecision::deny("MISSING_VARIANT"),
            Some(variant) if allowed_variants.iter().any(|v| v == variant) => {
                GateDecision::allow("VARIANT_MATCH")
            }
            Some(_) => GateDecision::deny("VARIANT_MISMATCH"),
        },

        GateNode::All { children } => {
            let mut last = GateDecision::allow("GATE_TRUE");
            for child in children {
                let decision = evaluate_at_depth(child, ctx, selectors, depth + 1);
                if !decision.allowed {
                    return decision;
                }
                last = decision;
            }
            last
        }

        GateNode::Any { children } => {
            let mut last = GateDecision::deny("GATE_FALSE");
            for child in children {
                let decision = evaluate_at_depth(child, ctx, selectors, depth + 1);
                if decision.allowed {
                    return decision;
                }
                last = decision;
            }
            last
        }

        GateNode::Not { child } => {
            let inner = evaluate_at_depth(child, ctx, selectors, depth + 1);
            GateDecision {
                allowed: !inner.allowed,
                reason_code: format!("NOT_{}", inner.reason_code),
            }
        }

        GateNode::Rollout { percent, salt } => match &ctx.user_id {
            None => GateDecision::deny("MISSING_USER_ID"),
            Some(user_id) => {
                let bucket = rollout_bucket(user_id, salt);
                if bucket < u64::from(*percent) {
                    GateDecision::allow("ROLLOUT_IN_BUCKET")
                } else {
                    GateDecision::deny("ROLLOUT_OUT_OF_BUCKET")
                }
            }
        },

        GateNode::RequestAttr {
            field,
            allowed_values,
        } => match ctx.request_attributes.get(field).and_then(|v| v.as_str()) {
            None => GateDecision::deny("MISSING_REQUEST_ATTR"),
            Some(value) if allowed_values.iter().any(|v| v == value) => {
                GateDecision::allow("REQUEST_ATTR_MATCH")
            }
            Some(_) => GateDecision::deny("REQUEST_ATTR_MISMATCH"),
        },

        GateNode::Selector { name } => match selectors.get(name) {
            None => GateDecision::deny("SELECTOR_NOT_REGISTERED"),
            Some(selector) => {
                if selector(ctx) {
                    GateDecision::allow("SELECTOR_TRUE")
                } else {
                    GateDecision::deny("SELECTOR_FALSE")
                }
            }
        },
    }
}

/// `fnv1a_64(user_id || 0x00 || salt) mod 100`, per the bit-exact contract
/// in §4.5. The null separator is hashed as its own UTF-16 code unit so the
/// concatenation cannot collide across a `user_id`/`salt` split point.
pub fn rollout_bucket(user_id: &str, salt: &str) -> u64 {
    let combined = format!("{user_id}\0{salt}");
    fnv1a_64_utf16(&combined) % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn ctx_with(user_id: Option<&str>) -> FlowContext {
        FlowContext::new(
            Default::default(),
            user_id.map(str::to_string),
            Default::default(),
            CancellationToken::new(),
            Instant::now() + Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn rollout_percent_zero_always_denies() {
        let selectors = SelectorRegistry::empty();
        let gate = GateNode::Rollout {
            percent: 0,
            salt: "s".into(),
        };
        let decision = evaluate(&gate, &ctx_with(Some("user-1")), &selectors);
        assert!(!decision.allowed);
    }

    #[test]
    fn rollout_percent_hundred_always_allows() {
        let selectors = SelectorRegistry::empty();
        let gate = GateNode::Rollout {
            percent: 100,
            salt: "s".into(),
        };
        let decision = evaluate(&gate, &ctx_with(Some("user-1")), &selectors);
        assert!(decision.allowed);
    }

    #[test]
    fn rollout_without_user_id_denies_with_missing_user_id() {
        let selectors = SelectorRegistry::empty();
        let gate = GateNode::Rollout {
            percent: 50,
            salt: "s".into(),
        };
        let decision = evaluate(&gate, &ctx_with(None), &selectors);
        assert_eq!(decision.reason_code, "MISSING_USER_ID");
    }

    #[test]
    fn not_inverts_the_decision() {
        let selectors = SelectorRegistry::empty();
        let always_true = GateNode::All { children: vec![] };
        let gate = GateNode::Not {
            child: Box::new(always_true),
        };
        let decision = evaluate(&gate, &ctx_with(None), &selectors);
        assert!(!decision.allowed);
    }

    #[test]
    fn selector_missing_from_registry_denies() {
        let selectors = SelectorRegistry::empty();
        let gate = GateNode::Selector {
            name: "not_registered".into(),
        };
        let decision = evaluate(&gate, &ctx_with(None), &selectors);
        assert_eq!(decision.reason_code, "SELECTOR_NOT_REGISTERED");
    }

    proptest! {
        #[test]
        fn not_always_inverts_allowed(percent in 0u8..=100u8, user_id in "[a-z]{1,12}") {
            let selectors = SelectorRegistry::empty();
            let child = GateNode::Rollout { percent, salt: "s".into() };
            let not_gate = GateNode::Not { child: Box::new(child.clone()) };
            let ctx = ctx_with(Some(&user_id));
            let child_decision = evaluate(&child, &ctx, &selectors);
            let not_decision = evaluate(&not_gate, &ctx, &selectors);
            prop_assert_eq!(not_decision.allowed, !child_decision.allowed);
        }

        #[test]
        fn bucket_is_always_in_range(user_id in "[a-z0-9]{1,16}", salt in "[a-z0-9]{0,8}") {
            let bucket = rollout_bucket(&user_id, &salt);
            prop_assert!(bucket < 100);
        }
    }
}
