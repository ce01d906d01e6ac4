//! Call registry
//!
//! Maps the identifier threaded through the kernel's integer parameter array
//! back to the context of the run that issued the foreign call. The table
//! lock is held only while the map itself changes; each context has its own
//! lock, taken by the callback that is currently executing for that run.
//!
//! Foreign entry points cannot receive the registry as an argument, so the
//! run that issues a foreign call installs it for the current thread with
//! [`RegistryScope`]. Scopes nest, which keeps a solve started from inside a
//! callback pointed at the right table.

use crate::context::CallContext;
use crate::error::{BridgeError, BridgeResult};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Process-unique identifier of one run; zero is reserved as invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(NonZeroU64);

impl CallId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(CallId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared handle to a registered context
pub type ContextHandle = Arc<Mutex<CallContext>>;

/// Lock a context, recovering it if a previous holder panicked
pub(crate) fn lock_context(handle: &ContextHandle) -> MutexGuard<'_, CallContext> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table of live runs
#[derive(Debug)]
pub struct CallRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<CallId, ContextHandle>>,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide registry for top-level entry points
    pub fn global() -> Arc<CallRegistry> {
        static GLOBAL: OnceLock<Arc<CallRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(CallRegistry::new())).clone()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<CallId, ContextHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a context under a fresh identifier
    pub fn register(&self, context: CallContext) -> CallId {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = match CallId::new(raw) {
            Some(id) => id,
            None => panic!("call identifier space exhausted"),
        };
        let previous = self.table().insert(id, Arc::new(Mutex::new(context)));
        assert!(previous.is_none(), "call identifier {} issued twice", id);
        tracing::trace!(target: "odebridge::registry", %id, "registered run");
        id
    }

    pub fn lookup(&self, id: CallId) -> BridgeResult<ContextHandle> {
        self.table()
            .get(&id)
            .cloned()
            .ok_or_else(|| BridgeError::unknown_call(id))
    }

    /// Remove a run's context
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered; every run unregisters exactly once.
    pub fn unregister(&self, id: CallId) -> ContextHandle {
        let removed = self.table().remove(&id);
        match removed {
            Some(handle) => {
                tracing::trace!(target: "odebridge::registry", %id, "retired run");
                handle
            }
            None => panic!("call {} unregistered twice or never registered", id),
        }
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.table().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

struct ActiveScope {
    registry: Arc<CallRegistry>,
    failure: Option<BridgeError>,
}

thread_local! {
    static ACTIVE: RefCell<Vec<ActiveScope>> = const { RefCell::new(Vec::new()) };
}

/// Registry installed for the current thread while a foreign call runs
///
/// Failures that cannot be attributed to a context (for example an unknown
/// identifier) are latched on the innermost scope.
#[must_use = "the registry is uninstalled when the scope is dropped"]
pub struct RegistryScope {
    depth: usize,
}

impl RegistryScope {
    pub fn enter(registry: Arc<CallRegistry>) -> Self {
        let depth = ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            active.push(ActiveScope {
                registry,
                failure: None,
            });
            active.len()
        });
        Self { depth }
    }

    /// Take the failure latched while this scope was innermost
    pub fn take_failure(&self) -> Option<BridgeError> {
        ACTIVE.with(|active| {
            active
                .borrow_mut()
                .get_mut(self.depth - 1)
                .and_then(|scope| scope.failure.take())
        })
    }
}

impl Drop for RegistryScope {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.borrow_mut().truncate(self.depth - 1));
    }
}

/// Registry of the innermost scope on this thread
pub(crate) fn active_registry() -> Option<Arc<CallRegistry>> {
    ACTIVE.with(|active| active.borrow().last().map(|scope| scope.registry.clone()))
}

/// Latch a failure on the innermost scope; the first failure wins
///
/// Returns `false` when no scope is installed.
pub(crate) fn latch_scope_failure(err: BridgeError) -> bool {
    ACTIVE.with(|active| match active.borrow_mut().last_mut() {
        Some(scope) => {
            if scope.failure.is_none() {
                scope.failure = Some(err);
            }
            true
        }
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;

    fn context() -> CallContext {
        CallContext::new(1, Box::new(|_t, _y, dy| {
            dy[0] = 0.0;
            Ok(())
        }))
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let registry = CallRegistry::new();
        let a = registry.register(context());
        let b = registry.register(context());
        assert_eq!(a.get(), 1);
        assert!(b > a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lookup_after_unregister_is_not_found() {
        let registry = CallRegistry::new();
        let id = registry.register(context());
        assert!(registry.lookup(id).is_ok());
        registry.unregister(id);
        assert!(matches!(
            registry.lookup(id),
            Err(BridgeError::InternalInconsistency(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic(expected = "unregistered twice")]
    fn test_double_unregister_panics() {
        let registry = CallRegistry::new();
        let id = registry.register(context());
        registry.unregister(id);
        registry.unregister(id);
    }

    #[test]
    fn test_zero_is_not_an_id() {
        assert!(CallId::new(0).is_none());
    }

    #[test]
    fn test_scopes_nest() {
        let outer = Arc::new(CallRegistry::new());
        let inner = Arc::new(CallRegistry::new());
        assert!(active_registry().is_none());

        let outer_scope = RegistryScope::enter(outer.clone());
        {
            let inner_scope = RegistryScope::enter(inner.clone());
            assert!(Arc::ptr_eq(&active_registry().unwrap(), &inner));
            assert!(latch_scope_failure(BridgeError::InternalInconsistency("a".into())));
            assert!(latch_scope_failure(BridgeError::InternalInconsistency("b".into())));
            let failure = inner_scope.take_failure();
            assert!(matches!(failure, Some(BridgeError::InternalInconsistency(m)) if m == "a"));
        }
        assert!(Arc::ptr_eq(&active_registry().unwrap(), &outer));
        assert!(outer_scope.take_failure().is_none());
        drop(outer_scope);
        assert!(!latch_scope_failure(BridgeError::InternalInconsistency("c".into())));
    }
}
