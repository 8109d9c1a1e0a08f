//! Thin composition root (§4.9): resolves a flow, selects a QoS tier,
//! fetches the config snapshot, evaluates overlays, and invokes the engine.

use crate::bulkhead::Bulkhead;
use crate::catalog::ModuleCatalog;
use crate::config::{ConfigError, ConfigSnapshotProvider};
use crate::context::FlowContext;
use crate::engine::{EngineError, ExecutionEngine, ExecutionResult, JoinRegistry};
use crate::patch::{PatchError, PatchEvaluator, QosTier, RequestOptions};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, miette::Diagnostic)]
pub enum HostError {
    #[error("flow {0:?} is not registered")]
    #[diagnostic(code(rockestra::host::flow_not_registered))]
    FlowNotRegistered(String),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

struct FlowRegistration {
    template: crate::blueprint::PlanTemplate,
    default_params: Option<Value>,
}

/// `flow_name → (blueprint, default params)`, constructed at bootstrap and
/// read-only once request serving begins (§5).
#[derive(Default)]
pub struct FlowRegistry {
    flows: RwLock<FxHashMap<String, Arc<FlowRegistration>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        template: crate::blueprint::PlanTemplate,
        default_params: Option<Value>,
    ) {
        let flow_name = template.flow_name.clone();
        self.flows
            .write()
            .expect("flow registry lock poisoned")
            .insert(flow_name, Arc::new(FlowRegistration { template, default_params }));
    }

    fn resolve(&self, flow_name: &str) -> Option<Arc<FlowRegistration>> {
        self.flows
            .read()
            .expect("flow registry lock poisoned")
            .get(flow_name)
            .cloned()
    }
}

/// Selects a QoS tier for a request. Default: always `Full`.
pub trait QosTierProvider: Send + Sync {
    fn select_tier(&self, flow_name: &str, request: &RequestOptions) -> QosTier;
}

pub struct FixedQosTierProvider(pub QosTier);

impl QosTierProvider for FixedQosTierProvider {
    fn select_tier(&self, _flow_name: &str, _request: &RequestOptions) -> QosTier {
        self.0
    }
}

pub struct FlowHost {
    pub flows: Arc<FlowRegistry>,
    pub catalog: Arc<ModuleCatalog>,
    pub selectors: Arc<crate::selectors::SelectorRegistry>,
    pub bulkhead: Arc<Bulkhead>,
    pub joins: Arc<JoinRegistry>,
    pub config_provider: Arc<dyn ConfigSnapshotProvider>,
    pub qos_provider: Arc<dyn QosTierProvider>,
}

impl FlowHost {
    pub async fn execute(
        &self,
        flow_name: &str,
        request: RequestOptions,
        timeout: Duration,
    ) -> Result<ExecutionResult, HostError> {
        let registration = self
            .flows
            .resolve(flow_name)
            .ok_or_else(|| HostError::FlowNotRegistered(flow_name.to_string()))?;

        let qos_tier = self.qos_provider.select_tier(flow_name, &request);

        // Construct the context before the first config fetch so its
        // snapshot cache (§4.4) covers this call from the start: any other
        // caller reusing `ctx` would also hit the cache rather than refetch.
        let ctx = FlowContext::new(
            request.variants.clone(),
            request.user_id.clone(),
            request.request_attributes.clone(),
            CancellationToken::new(),
            Instant::now() + timeout,
        )
        .map_err(EngineError::from)?;

        let snapshot = ctx
            .get_or_fetch_snapshot(self.config_provider.as_ref(), flow_name)
            .await?;

        if let Some(limits) = &snapshot.patch.limits {
            self.bulkhead
                .set_limits(limits.module_concurrency.max_in_flight.clone());
        }

        let evaluation = PatchEvaluator::evaluate(
            flow_name,
            &snapshot.patch,
            registration.default_params.as_ref(),
            &request,
            qos_tier,
        )?;

        let engine = ExecutionEngine::new(&self.catalog, &self.selectors, &self.bulkhead, &self.joins);
        let mut result = engine
            .execute_with_context(&registration.template, Some(Arc::new(evaluation)), &ctx)
            .await?;
        result.explain.qos_selected_tier = Some(format!("{qos_tier:?}").to_lowercase());
        result.explain.config_lkg_fallback = snapshot.lkg_evidence.fallback;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::BlueprintBuilder;
    use crate::catalog::{Lifetime, ThreadSafety};
    use crate::config::{ConfigSnapshot, LkgEvidence, SnapshotMeta};
    use crate::module::{Module, ModuleContext};
    use crate::outcome::Outcome;
    use crate::patch::PatchDocument;
    use async_trait::async_trait;

    struct AlwaysOk;
    #[async_trait]
    impl Module for AlwaysOk {
        async fn execute(&self, _ctx: ModuleContext<'_>) -> Outcome<Value> {
            Outcome::ok(Value::Null)
        }
    }

    struct FixedSnapshotProvider(ConfigSnapshot);
    #[async_trait]
    impl ConfigSnapshotProvider for FixedSnapshotProvider {
        async fn get_snapshot(&self, _flow_name: &str) -> Result<ConfigSnapshot, ConfigError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn host_executes_a_registered_flow() {
        let template = BlueprintBuilder::new("demo").step("a", "AlwaysOk").build().unwrap();
        let flows = Arc::new(FlowRegistry::new());
        flows.register(template, None);

        let catalog = Arc::new(ModuleCatalog::new());
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

        let snapshot = ConfigSnapshot {
            config_version: 1,
            patch: PatchDocument {
                schema_version: "v1".to_string(),
                flows: Default::default(),
                limits: None,
            },
            default_params: Default::default(),
            meta: SnapshotMeta {
                source: "static".to_string(),
                fetched_at: chrono::Utc::now(),
            },
            lkg_evidence: LkgEvidence::default(),
        };

        let host = FlowHost {
            flows,
            catalog,
            selectors: Arc::new(crate::selectors::SelectorRegistry::empty()),
            bulkhead: Arc::new(Bulkhead::new()),
            joins: Arc::new(JoinRegistry::new()),
            config_provider: Arc::new(FixedSnapshotProvider(snapshot)),
            qos_provider: Arc::new(FixedQosTierProvider(QosTier::Full)),
        };

        let result = host
            .execute("demo", RequestOptions::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.outcome.code(), "OK");
        assert_eq!(result.explain.qos_selected_tier.as_deref(), Some("full"));
    }

    #[tokio::test]
    async fn unregistered_flow_is_rejected() {
        let host = FlowHost {
            flows: Arc::new(FlowRegistry::new()),
            catalog: Arc::new(ModuleCatalog::new()),
            selectors: Arc::new(crate::selectors::SelectorRegistry::empty()),
            bulkhead: Arc::new(Bulkhead::new()),
            joins: Arc::new(JoinRegistry::new()),
            config_provider: Arc::new(FixedSnapshotProvider(ConfigSnapshot {
                config_version: 1,
                patch: PatchDocument {
                    schema_version: "v1".to_string(),
                    flows: Default::default(),
                    limits: None,
                },
                default_params: Default::default(),
                meta: SnapshotMeta {
                    source: "static".to_string(),
                    fetched_at: chrono::Utc::now(),
                },
                lkg_evidence: LkgEvidence::default(),
            })),
            qos_provider: Arc::new(FixedQosTierProvider(QosTier::Full)),
        };
        let err = host
            .execute("missing", RequestOptions::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::FlowNotRegistered(n) if n == "missing"));
    }
}
