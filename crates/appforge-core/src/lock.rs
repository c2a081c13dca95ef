//! Per-target mutual exclusion.
//!
//! At most one creation task may mutate a given `(user_id, sanitized
//! app_name)` target at a time. A second request for a held target is
//! rejected immediately; there is no waiting queue.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::request::{CreateNovelAppRequest, sanitize_app_name};

/// Normalized identity of the application a task is creating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    user_id: String,
    app_name: String,
}

impl TargetKey {
    /// Build a key, sanitizing the app name the same way the generated
    /// directory name is sanitized.
    pub fn new(user_id: impl Into<String>, app_name: &str) -> Self {
        Self {
            user_id: user_id.into(),
            app_name: sanitize_app_name(app_name),
        }
    }

    pub fn for_request(request: &CreateNovelAppRequest) -> Self {
        Self::new(request.user_id.clone(), &request.base_config.app_name)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The sanitized app name.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.app_name)
    }
}

/// Set of targets currently held by running tasks.
///
/// Cloning shares the same underlying set.
#[derive(Debug, Clone, Default)]
pub struct TargetLocks {
    held: Arc<Mutex<HashSet<TargetKey>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` if no other task holds it.
    ///
    /// The claim is released when the returned guard is dropped, on every
    /// exit path including panics.
    pub fn try_acquire(&self, key: TargetKey) -> Option<TargetGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }
        Some(TargetGuard {
            key,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, key: &TargetKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Number of targets currently held.
    pub fn len(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof that the holder owns a target. Releases it on drop.
#[derive(Debug)]
pub struct TargetGuard {
    key: TargetKey,
    held: Arc<Mutex<HashSet<TargetKey>>>,
}

impl TargetGuard {
    pub fn key(&self) -> &TargetKey {
        &self.key
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_sanitizes_app_name() {
        let key = TargetKey::new("u1", "my:app?");
        assert_eq!(key.app_name(), "my_app_");
        assert_eq!(key.to_string(), "u1/my_app_");
    }

    #[test]
    fn names_that_sanitize_identically_collide() {
        assert_eq!(TargetKey::new("u1", "a/b"), TargetKey::new("u1", "a\\b"));
        assert_ne!(TargetKey::new("u1", "a"), TargetKey::new("u2", "a"));
    }

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let locks = TargetLocks::new();
        let key = TargetKey::new("u1", "novel123");

        let guard = locks.try_acquire(key.clone()).expect("first acquire");
        assert!(locks.is_held(&key));
        assert!(locks.try_acquire(key.clone()).is_none());

        drop(guard);
        assert!(!locks.is_held(&key));
        assert!(locks.try_acquire(key).is_some());
    }

    #[test]
    fn different_targets_do_not_conflict() {
        let locks = TargetLocks::new();
        let _a = locks.try_acquire(TargetKey::new("u1", "a")).unwrap();
        let _b = locks.try_acquire(TargetKey::new("u1", "b")).unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn clones_share_state() {
        let locks = TargetLocks::new();
        let other = locks.clone();
        let _g = locks.try_acquire(TargetKey::new("u1", "a")).unwrap();
        assert!(other.try_acquire(TargetKey::new("u1", "a")).is_none());
    }

    #[test]
    fn concurrent_acquire_admits_exactly_one() {
        let locks = TargetLocks::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.try_acquire(TargetKey::new("u1", "novel123"))
                })
            })
            .collect();

        let guards: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.iter().filter(|g| g.is_some()).count(), 1);
    }

    #[test]
    fn guard_released_on_panic() {
        let locks = TargetLocks::new();
        let inner = locks.clone();
        let result = std::panic::catch_unwind(move || {
            let _g = inner.try_acquire(TargetKey::new("u1", "a")).unwrap();
            panic!("phase blew up");
        });
        assert!(result.is_err());
        assert!(locks.is_empty());
    }
}
