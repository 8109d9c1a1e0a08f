//! Registry of module-type-name → module descriptor (§4.2).
//!
//! Grounded on the same "registry with duplicate-rejecting `register` and
//! read-only lookup" shape used elsewhere in this crate for
//! [`crate::selectors::SelectorRegistry`]; singleton memoization and the
//! single-permit concurrency gate are this module's own addition on top of
//! that shape.

use crate::module::{Module, ModuleFactory};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    Transient,
    Singleton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSafety {
    ThreadSafe,
    NotThreadSafe,
}

/// Validates a module's `with` args before construction. Returns `Err` with
/// a human-readable message on rejection.
pub type ArgsValidator = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

pub struct ModuleDescriptor {
    pub type_name: String,
    pub args_type: String,
    pub output_type: String,
    pub lifetime: Lifetime,
    pub thread_safety: ThreadSafety,
    pub args_validator: Option<ArgsValidator>,
    pub concurrency_key: Option<String>,
    factory: ModuleFactory,
    singleton: OnceLock<Arc<dyn Module>>,
    /// Held while a Singleton+NotThreadSafe instance is executing. `false` = free.
    occupied: AtomicBool,
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("type_name", &self.type_name)
            .field("lifetime", &self.lifetime)
            .field("thread_safety", &self.thread_safety)
            .finish()
    }
}

impl ModuleDescriptor {
    /// Produces the module instance for one `acquire`: memoized for
    /// `Singleton`, freshly constructed for `Transient`.
    pub fn acquire(&self) -> Arc<dyn Module> {
        match self.lifetime {
            Lifetime::Transient => (self.factory)(),
            Lifetime::Singleton => self.singleton.get_or_init(|| (self.factory)()).clone(),
        }
    }

    /// Singleton+NotThreadSafe guard: non-blocking try-acquire. Returns a
    /// guard that releases the permit on drop. Fails fast rather than
    /// serializing — per §4.2, double occupancy is a design-bug signal.
    pub fn try_enter(&self) -> Result<Option<SingletonPermit<'_>>, CatalogError> {
        if self.lifetime != Lifetime::Singleton || self.thread_safety != ThreadSafety::NotThreadSafe
        {
            return Ok(None);
        }
        if self
            .occupied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CatalogError::ConcurrencyViolation {
                module_type: self.type_name.clone(),
            });
        }
        Ok(Some(SingletonPermit { descriptor: self }))
    }
}

/// RAII guard releasing a Singleton+NotThreadSafe permit on drop.
pub struct SingletonPermit<'a> {
    descriptor: &'a ModuleDescriptor,
}

impl Drop for SingletonPermit<'_> {
    fn drop(&mut self) {
        self.descriptor.occupied.store(false, Ordering::Release);
    }
}

#[derive(Debug, Error, miette::Diagnostic)]
pub enum CatalogError {
    #[error("module type {0:?} is already registered")]
    #[diagnostic(code(rockestra::catalog::duplicate_type))]
    DuplicateModuleType(String),
    #[error("module type {0:?} is not registered")]
    #[diagnostic(code(rockestra::catalog::type_not_registered))]
    TypeNotRegistered(String),
    /// Contract violation (§7): propagates as a real error, not an `Outcome`.
    #[error("singleton module of type {module_type:?} was entered concurrently")]
    #[diagnostic(
        code(rockestra::catalog::concurrency_violation),
        help("a Singleton+NotThreadSafe module must not be entered from two tasks at once")
    )]
    ConcurrencyViolation { module_type: String },
}

/// Registry of module-type-name → [`ModuleDescriptor`]. Constructed during
/// bootstrap and read-only once request serving begins (§5); this crate
/// does not enforce that at the type level but callers should stop calling
/// `register` before serving traffic.
#[derive(Default)]
pub struct ModuleCatalog {
    descriptors: RwLock<FxHashMap<String, Arc<ModuleDescriptor>>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        type_name: impl Into<String>,
        factory: ModuleFactory,
        args_type: impl Into<String>,
        output_type: impl Into<String>,
        lifetime: Lifetime,
        thread_safety: ThreadSafety,
        args_validator: Option<ArgsValidator>,
        concurrency_key: Option<String>,
    ) -> Result<(), CatalogError> {
        let type_name = type_name.into();
        let mut guard = self.descriptors.write().expect("catalog lock poisoned");
        if guard.contains_key(&type_name) {
            return Err(CatalogError::DuplicateModuleType(type_name));
        }
        guard.insert(
            type_name.clone(),
            Arc::new(ModuleDescriptor {
                type_name,
                args_type: args_type.into(),
                output_type: output_type.into(),
                lifetime,
                thread_safety,
                args_validator,
                concurrency_key,
                factory,
                singleton: OnceLock::new(),
                occupied: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    pub fn resolve(&self, type_name: &str) -> Result<Arc<ModuleDescriptor>, CatalogError> {
        self.descriptors
            .read()
            .expect("catalog lock poisoned")
            .get(type_name)
            .cloned()
            .ok_or_else(|| CatalogError::TypeNotRegistered(type_name.to_string()))
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.descriptors
            .read()
            .expect("catalog lock poisoned")
            .contains_key(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleContext;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingModule(Arc<AtomicU32>);

    #[async_trait]
    impl Module for CountingModule {
        async fn execute(&self, _ctx: ModuleContext<'_>) -> crate::outcome::Outcome<Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            crate::outcome::Outcome::ok(Value::Null)
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let catalog = ModuleCatalog::new();
        let factory: ModuleFactory = Arc::new(|| Arc::new(CountingModule(Arc::new(AtomicU32::new(0)))));
        catalog
            .register(
                "demo",
                factory.clone(),
                "Args",
                "Out",
                Lifetime::Transient,
                ThreadSafety::ThreadSafe,
                None,
                None,
            )
            .unwrap();
        let err = catalog
            .register(
                "demo",
                factory,
                "Args",
                "Out",
                Lifetime::Transient,
                ThreadSafety::ThreadSafe,
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateModuleType(n) if n == "demo"));
    }

    #[test]
    fn singleton_is_memoized_across_acquires() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_for_factory = counter.clone();
        let catalog = ModuleCatalog::new();
        catalog
            .register(
                "singleton",
                Arc::new(move || {
                    counter_for_factory.fetch_add(1, Ordering::SeqCst);
                    Arc::new(CountingModule(Arc::new(AtomicU32::new(0)))) as Arc<dyn Module>
                }),
                "Args",
                "Out",
                Lifetime::Singleton,
                ThreadSafety::ThreadSafe,
                None,
                None,
            )
            .unwrap();
        let descriptor = catalog.resolve("singleton").unwrap();
        descriptor.acquire();
        descriptor.acquire();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_thread_safe_singleton_rejects_concurrent_entry() {
        let catalog = ModuleCatalog::new();
        catalog
            .register(
                "exclusive",
                Arc::new(|| Arc::new(CountingModule(Arc::new(AtomicU32::new(0)))) as Arc<dyn Module>),
                "Args",
                "Out",
                Lifetime::Singleton,
                ThreadSafety::NotThreadSafe,
                None,
                None,
            )
            .unwrap();
        let descriptor = catalog.resolve("exclusive").unwrap();
        let _permit = descriptor.try_enter().unwrap();
        let err = descriptor.try_enter().unwrap_err();
        assert!(matches!(err, CatalogError::ConcurrencyViolation { .. }));
    }

    #[test]
    fn resolve_unknown_type_fails() {
        let catalog = ModuleCatalog::new();
        let err = catalog.resolve("missing").unwrap_err();
        assert!(matches!(err, CatalogError::TypeNotRegistered(n) if n == "missing"));
    }
}
