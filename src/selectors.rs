//! Registry of named predicates over the flow context (§4.3).

use crate::context::FlowContext;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub type Selector = Arc<dyn Fn(&FlowContext) -> bool + Send + Sync>;

#[derive(Debug, Error, miette::Diagnostic)]
pub enum SelectorError {
    #[error("selector name must not be empty")]
    #[diagnostic(code(rockestra::selectors::empty_name))]
    EmptyName,
    #[error("registry is read-only")]
    #[diagnostic(code(rockestra::selectors::read_only))]
    ReadOnly,
}

/// Named predicate registry. Lookup failures are never surfaced as errors
/// from this type — the gate evaluator turns a missing/unregistered name
/// into a `SELECTOR_NOT_REGISTERED` deny decision (§4.5).
pub struct SelectorRegistry {
    selectors: RwLock<FxHashMap<String, Selector>>,
    read_only: bool,
}

impl Default for SelectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self {
            selectors: RwLock::new(FxHashMap::default()),
            read_only: false,
        }
    }

    /// An immutable registry with no entries; any `register` call fails.
    pub fn empty() -> Self {
        Self {
            selectors: RwLock::new(FxHashMap::default()),
            read_only: true,
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        selector: Selector,
    ) -> Result<(), SelectorError> {
        if self.read_only {
            return Err(SelectorError::ReadOnly);
        }
        let name = name.into();
        if name.is_empty() {
            return Err(SelectorError::EmptyName);
        }
        self.selectors
            .write()
            .expect("selector registry lock poisoned")
            .insert(name, selector);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Selector> {
        self.selectors
            .read()
            .expect("selector registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.selectors
            .read()
            .expect("selector registry lock poisoned")
            .contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn empty_registry_rejects_register() {
        let registry = SelectorRegistry::empty();
        let err = registry
            .register("always_true", Arc::new(|_: &FlowContext| true))
            .unwrap_err();
        assert!(matches!(err, SelectorError::ReadOnly));
    }

    #[test]
    fn registered_selector_can_be_invoked() {
        let registry = SelectorRegistry::new();
        registry
            .register("always_false", Arc::new(|_: &FlowContext| false))
            .unwrap();
        let selector = registry.get("always_false").unwrap();
        assert!(!selector(&ctx()));
    }

    #[test]
    fn empty_name_is_rejected() {
        let registry = SelectorRegistry::new();
        let err = registry
            .register("", Arc::new(|_: &FlowContext| true))
            .unwrap_err();
        assert!(matches!(err, SelectorError::EmptyName));
    }
}
