//! Process-wide non-blocking per-key concurrency limiter (§4.7 step 9,
//! §6). Grounded on the same lock-free try-acquire shape as
//! [`crate::catalog::ModuleDescriptor::try_enter`], generalized from a
//! single bit to a per-key counted limit.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Held while one admitted unit of work occupies its bulkhead slot.
/// Releases the slot on drop so a panicking module body cannot leak
/// capacity.
pub struct BulkheadPermit {
    counter: Arc<AtomicU32>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Admission gate keyed by `limitKey` (falling back to module type name),
/// with limits sourced from `limits.moduleConcurrency.maxInFlight` (§6).
/// Unlisted keys are unlimited.
#[derive(Default)]
pub struct Bulkhead {
    limits: RwLock<FxHashMap<String, u32>>,
    in_flight: RwLock<FxHashMap<String, Arc<AtomicU32>>>,
}

impl Bulkhead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_limits(&self, limits: FxHashMap<String, u32>) {
        *self.limits.write().expect("bulkhead limits lock poisoned") = limits;
    }

    /// Non-blocking: returns `None` immediately if `key` is at its limit.
    pub fn try_admit(&self, key: &str) -> Option<BulkheadPermit> {
        let limit = self
            .limits
            .read()
            .expect("bulkhead limits lock poisoned")
            .get(key)
            .copied();
        let Some(limit) = limit else {
            return Some(BulkheadPermit {
                counter: Arc::new(AtomicU32::new(0)),
            });
        };

        let counter = {
            let mut guard = self.in_flight.write().expect("bulkhead in-flight lock poisoned");
            guard.entry(key.to_string()).or_default().clone()
        };

        loop {
            let current = counter.load(Ordering::Acquire);
            if current >= limit {
                return None;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(BulkheadPermit { counter });
            }
        }
    }
}
