//! Config snapshot providers (§4.4): a composable chain turning "fetch the
//! current patch document" into a policy with validation, caching, and
//! last-known-good fallback.

pub mod lkg_store;

pub use lkg_store::{FileLkgSnapshotStore, InMemoryLkgSnapshotStore, LkgLoadResult, LkgSnapshotStore};

use crate::patch::PatchDocument;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LkgEvidence {
    pub fallback: bool,
    pub last_good_config_version: Option<u64>,
}

/// A fetched, not-yet-validated-or-applied patch document plus the
/// provenance metadata every provider in the chain threads through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub config_version: u64,
    pub patch: PatchDocument,
    pub default_params: rustc_hash::FxHashMap<String, Value>,
    pub meta: SnapshotMeta,
    pub lkg_evidence: LkgEvidence,
}

#[derive(Debug, Error, miette::Diagnostic)]
pub enum ConfigError {
    #[error("config provider failed: {message}")]
    #[diagnostic(code(rockestra::config::provider_failed))]
    ProviderFailed { message: String },
    #[error("no last-known-good snapshot is available after provider failure: {reason}")]
    #[diagnostic(
        code(rockestra::config::no_fallback),
        help("the inner provider failed and no validated snapshot was ever persisted")
    )]
    NoFallbackAvailable { reason: String },
}

/// Validates a fetched snapshot before it is accepted. A provider chain
/// shares one validator so "valid" means the same thing at every layer.
pub type SnapshotValidator = Arc<dyn Fn(&ConfigSnapshot) -> Result<(), String> + Send + Sync>;

#[async_trait]
pub trait ConfigSnapshotProvider: Send + Sync {
    async fn get_snapshot(&self, flow_name: &str) -> Result<ConfigSnapshot, ConfigError>;
}

/// Returns the same fixed snapshot for every flow. Used in tests and for
/// flows with no external config dependency.
pub struct StaticProvider {
    snapshot: ConfigSnapshot,
}

impl StaticProvider {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl ConfigSnapshotProvider for StaticProvider {
    async fn get_snapshot(&self, _flow_name: &str) -> Result<ConfigSnapshot, ConfigError> {
        Ok(self.snapshot.clone())
    }
}

/// Wraps an inner provider with validation and last-known-good fallback,
/// per the exact policy in §4.4:
/// 1. Inner fails → try the store; a valid stored snapshot returns with
///    `lkg_evidence.fallback = true`; absent/corrupt store rethrows.
/// 2. Inner succeeds but the candidate is invalid → same fallback path.
/// 3. Inner succeeds and the candidate is valid → persist best-effort,
///    return the candidate untouched. A previously stored LKG is never
///    overwritten by an invalid candidate.
pub struct PersistedLkgProvider {
    inner: Arc<dyn ConfigSnapshotProvider>,
    store: Arc<dyn LkgSnapshotStore>,
    validator: SnapshotValidator,
}

impl PersistedLkgProvider {
    pub fn new(
        inner: Arc<dyn ConfigSnapshotProvider>,
        store: Arc<dyn LkgSnapshotStore>,
        validator: SnapshotValidator,
    ) -> Self {
        Self {
            inner,
            store,
            validator,
        }
    }

    /// Falls back to the persisted last-known-good snapshot. `reason`
    /// describes the failure that triggered the fallback (the inner
    /// provider's error, or the validator's rejection message); if the
    /// store itself is absent or corrupt, that original failure is
    /// rethrown rather than masked behind a generic error (§4.4).
    async fn fall_back(&self, flow_name: &str, reason: String) -> Result<ConfigSnapshot, ConfigError> {
        match self.store.load(flow_name).await {
            Ok(LkgLoadResult::Loaded(mut snapshot)) => {
                snapshot.lkg_evidence.fallback = true;
                snapshot.lkg_evidence.last_good_config_version = Some(snapshot.config_version);
                snapshot.meta.source = "lkg".to_string();
                Ok(snapshot)
            }
            Ok(LkgLoadResult::NotFound | LkgLoadResult::Corrupt) => {
                Err(ConfigError::NoFallbackAvailable { reason })
            }
            Err(_) => Err(ConfigError::NoFallbackAvailable { reason }),
        }
    }
}

#[async_trait]
impl ConfigSnapshotProvider for PersistedLkgProvider {
    async fn get_snapshot(&self, flow_name: &str) -> Result<ConfigSnapshot, ConfigError> {
        match self.inner.get_snapshot(flow_name).await {
            Ok(candidate) => match (self.validator)(&candidate) {
                Ok(()) => {
                    // Best-effort: a persist failure must not fail the request.
                    let _ = self.store.persist(flow_name, &candidate).await;
                    Ok(candidate)
                }
                Err(reason) => {
                    self.fall_back(flow_name, format!("snapshot failed validation: {reason}"))
                        .await
                }
            },
            Err(err) => self.fall_back(flow_name, err.to_string()).await,
        }
    }
}
