//! The cluster-wide exclusive operation lock.
//!
//! Stepdown must hold the server's global operation-mode lock exclusively
//! while it demotes. The lock itself belongs to the server; the coordinator
//! sees it through [`GlobalLock`] and releases it on every exit path via the
//! guard's `Drop`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Releases the underlying lock when dropped.
pub struct GlobalLockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl GlobalLockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A guard over nothing, for lock implementations with no state.
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for GlobalLockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for GlobalLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalLockGuard").finish_non_exhaustive()
    }
}

/// The exclusive-operation lock collaborator.
pub trait GlobalLock: Send + Sync {
    /// Attempts exclusive acquisition within `timeout`.
    ///
    /// `None` means the budget elapsed without acquisition; the caller
    /// reports `ExceededTimeLimit`.
    fn try_lock_exclusive(&self, timeout: Duration) -> Option<GlobalLockGuard>;
}

/// A lock that is always free; the default for embedders without one.
#[derive(Debug, Default)]
pub struct NoopGlobalLock;

impl GlobalLock for NoopGlobalLock {
    fn try_lock_exclusive(&self, _timeout: Duration) -> Option<GlobalLockGuard> {
        Some(GlobalLockGuard::noop())
    }
}

/// Test lock that can be held externally to starve acquisition.
#[derive(Debug, Default)]
pub struct TestGlobalLock {
    held: Arc<AtomicBool>,
}

impl TestGlobalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the lock until the returned guard drops.
    pub fn hold(&self) -> GlobalLockGuard {
        assert!(
            !self.held.swap(true, Ordering::SeqCst),
            "test lock already held"
        );
        let held = Arc::clone(&self.held);
        GlobalLockGuard::new(move || held.store(false, Ordering::SeqCst))
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl GlobalLock for TestGlobalLock {
    fn try_lock_exclusive(&self, _timeout: Duration) -> Option<GlobalLockGuard> {
        if self.held.swap(true, Ordering::SeqCst) {
            return None;
        }
        let held = Arc::clone(&self.held);
        Some(GlobalLockGuard::new(move || {
            held.store(false, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_lock_always_acquires() {
        let lock = NoopGlobalLock;
        assert!(lock.try_lock_exclusive(Duration::ZERO).is_some());
    }

    #[test]
    fn test_lock_starves_while_held() {
        let lock = TestGlobalLock::new();
        {
            let _held = lock.hold();
            assert!(lock.try_lock_exclusive(Duration::from_millis(5)).is_none());
        }
        let guard = lock.try_lock_exclusive(Duration::ZERO);
        assert!(guard.is_some());
        assert!(lock.is_held());
        drop(guard);
        assert!(!lock.is_held());
    }
}
