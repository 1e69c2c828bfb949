use foldhash::fast::RandomState;
use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

type CancelAction = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct RegistryInner {
    index: AtomicU64,
    tokens: dashmap::DashMap<u64, CancelToken, RandomState>,
}

/// Set of cancel callbacks for the calls that are still in flight.
///
/// One registry is shared by every call issued through a client API instance
/// (and, on the server, by every held subscription). A token is present while
/// its call is active and is removed exactly once when the call reaches a
/// terminal state, whichever party ended it.
///
/// The registry is a cheap handle: clones share the same set.
#[derive(Clone, Default)]
pub struct CancellationRegistry(Arc<RegistryInner>);

struct TokenInner {
    id: u64,
    fired: AtomicBool,
    action: Mutex<Option<CancelAction>>,
    registry: Weak<RegistryInner>,
}

/// Handle to one registered cancel callback.
///
/// Both [`cancel`](Self::cancel) and [`retire`](Self::retire) take effect only
/// once per token: whichever happens first wins and later calls are no-ops.
#[derive(Clone)]
pub struct CancelToken(Arc<TokenInner>);

impl CancellationRegistry {
    /// Registers `action` and returns the token that triggers it.
    ///
    /// Every registration gets its own id, so registering the same method
    /// twice never makes two calls share a token.
    pub fn register(&self, action: impl FnOnce() + Send + 'static) -> CancelToken {
        let id = self.0.index.fetch_add(1, Ordering::SeqCst);
        let token = CancelToken(Arc::new(TokenInner {
            id,
            fired: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
            registry: Arc::downgrade(&self.0),
        }));
        self.0.tokens.insert(id, token.clone());
        token
    }

    /// Removes `token` from the set without running it.
    ///
    /// Returns false if the token was not present.
    pub fn remove(&self, token: &CancelToken) -> bool {
        self.0.tokens.remove(&token.id()).is_some()
    }

    #[must_use]
    pub fn contains(&self, token: &CancelToken) -> bool {
        self.0.tokens.contains_key(&token.id())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.tokens.is_empty()
    }

    /// Cancels every registered token and returns how many were cancelled.
    ///
    /// The set is snapshotted first and tokens run outside the map's locks, so
    /// a token that removes itself (or registers another one) while running
    /// does not disturb the pass. Tokens registered during the pass are left
    /// alone.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancelToken> = self.0.tokens.iter().map(|e| e.value().clone()).collect();
        let cancelled = tokens.iter().filter(|token| token.cancel()).count();
        if cancelled > 0 {
            tracing::debug!("cancelled {cancelled} registered calls");
        }
        cancelled
    }
}

impl std::fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl CancelToken {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Returns true once the token was cancelled or retired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.0.fired.load(Ordering::Acquire)
    }

    /// Removes the token from its registry and runs its action.
    ///
    /// Returns false, doing nothing, if the token already fired.
    pub fn cancel(&self) -> bool {
        let Some(action) = self.fire() else {
            return false;
        };
        action();
        true
    }

    /// Removes the token from its registry without running its action.
    ///
    /// Used when the call reached a terminal state on its own.
    pub fn retire(&self) -> bool {
        self.fire().is_some()
    }

    fn fire(&self) -> Option<CancelAction> {
        if self.0.fired.swap(true, Ordering::AcqRel) {
            return None;
        }
        if let Some(registry) = self.0.registry.upgrade() {
            registry.tokens.remove(&self.0.id);
        }
        // a poisoned lock still holds the action, take it anyway.
        let mut action = self
            .0
            .action
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        action.take()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("id", &self.0.id)
            .field("fired", &self.is_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_register_and_retire() {
        let registry = CancellationRegistry::default();
        let (count, action) = counter();
        let token = registry.register(action);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&token));

        assert!(token.retire());
        assert!(registry.is_empty());
        assert!(!token.cancel());
        assert!(!token.retire());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_runs_once() {
        let registry = CancellationRegistry::default();
        let (count, action) = counter();
        let token = registry.register(action);

        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_fired());
        assert!(registry.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = CancellationRegistry::default();
        let token = registry.register(|| {});
        assert!(registry.remove(&token));
        assert!(!registry.remove(&token));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = CancellationRegistry::default();
        let a = registry.register(|| {});
        let b = registry.register(|| {});
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        a.retire();
        assert!(registry.contains(&b));
    }

    #[test]
    fn test_cancel_all_with_reentrant_removal() {
        let registry = CancellationRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        let slots: Arc<Mutex<Vec<CancelToken>>> = Arc::default();

        for _ in 0..8 {
            let count = count.clone();
            let slots_ref = slots.clone();
            let registry_ref = registry.clone();
            let token = registry.register(move || {
                count.fetch_add(1, Ordering::SeqCst);
                // removing every known token from inside a callback must not
                // make the bulk pass skip the remaining ones.
                for token in slots_ref.lock().unwrap().iter() {
                    registry_ref.remove(token);
                }
            });
            slots.lock().unwrap().push(token);
        }

        assert_eq!(registry.cancel_all(), 8);
        assert_eq!(count.load(Ordering::SeqCst), 8);
        assert!(registry.is_empty());
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn test_register_during_cancel_all() {
        let registry = CancellationRegistry::default();
        let late: Arc<Mutex<Option<CancelToken>>> = Arc::default();
        {
            let registry_ref = registry.clone();
            let late = late.clone();
            registry.register(move || {
                *late.lock().unwrap() = Some(registry_ref.register(|| {}));
            });
        }

        assert_eq!(registry.cancel_all(), 1);
        let late = late.lock().unwrap().clone().unwrap();
        assert!(registry.contains(&late));
        assert!(!late.is_fired());
    }

    #[test]
    fn test_token_outlives_registry() {
        let registry = CancellationRegistry::default();
        let (count, action) = counter();
        let token = registry.register(action);
        drop(registry);
        assert!(token.cancel());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
