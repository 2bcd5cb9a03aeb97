//! Device ownership arbitration
//!
//! At most one session may drive the microphone/speaker at a time. A new
//! claim forcibly evicts the previous holder through its eviction handler,
//! which must silence that session's hardware before the new claim is
//! granted.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies the session holding (or requesting) device ownership
pub type OwnerId = Uuid;

type EvictionHandler = Box<dyn FnOnce() + Send>;

/// Proof of exclusive hardware access
///
/// Exactly one token is valid per arbiter at any instant. Acquiring a new
/// one invalidates the previous holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipToken {
    owner: OwnerId,
}

impl OwnershipToken {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

struct OwnerSlot {
    owner: OwnerId,
    on_evicted: EvictionHandler,
}

/// Registry of "who currently owns the audio hardware"
///
/// Inject one per process (or use [`DeviceArbiter::global`]) so ownership
/// transfer stays an explicit, testable call.
#[derive(Default)]
pub struct DeviceArbiter {
    slot: Mutex<Option<OwnerSlot>>,
}

static GLOBAL: Lazy<Arc<DeviceArbiter>> = Lazy::new(|| Arc::new(DeviceArbiter::new()));

impl DeviceArbiter {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Process-wide default instance
    pub fn global() -> Arc<DeviceArbiter> {
        Arc::clone(&GLOBAL)
    }

    /// Claim exclusive device ownership for `owner`
    ///
    /// If a different owner holds the token, its eviction handler runs
    /// synchronously before the new token is granted. The handler runs with
    /// the registry lock released, so a handler that calls [`release`] (as
    /// teardown does) cannot deadlock. Claiming while already the holder
    /// replaces the slot without firing the handler.
    ///
    /// [`release`]: DeviceArbiter::release
    pub fn claim(
        &self,
        owner: OwnerId,
        on_evicted: impl FnOnce() + Send + 'static,
    ) -> OwnershipToken {
        let mut incoming: Option<EvictionHandler> = Some(Box::new(on_evicted));

        loop {
            let evicted = {
                let mut slot = self.slot.lock();
                match slot.take() {
                    Some(prev) if prev.owner != owner => Some(prev),
                    _ => {
                        if let Some(handler) = incoming.take() {
                            *slot = Some(OwnerSlot {
                                owner,
                                on_evicted: handler,
                            });
                        }
                        None
                    },
                }
            };

            match evicted {
                Some(prev) => {
                    tracing::info!(
                        evicted = %prev.owner,
                        claimant = %owner,
                        "evicting previous audio owner"
                    );
                    (prev.on_evicted)();
                    // A racing claim may have installed itself while the
                    // handler ran; loop until our slot sticks.
                },
                None => {
                    tracing::debug!(owner = %owner, "audio ownership granted");
                    return OwnershipToken { owner };
                },
            }
        }
    }

    /// Release ownership if `owner` still holds it
    ///
    /// A stale release from an already-evicted owner is a no-op. Returns
    /// whether the token was actually cleared.
    pub fn release(&self, owner: OwnerId) -> bool {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|s| s.owner) == Some(owner) {
            *slot = None;
            tracing::debug!(owner = %owner, "audio ownership released");
            true
        } else {
            false
        }
    }

    /// The owner currently holding the token, if any
    pub fn current_owner(&self) -> Option<OwnerId> {
        self.slot.lock().as_ref().map(|s| s.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_claim_grants_token() {
        let arbiter = DeviceArbiter::new();
        let owner = Uuid::new_v4();

        let token = arbiter.claim(owner, || {});
        assert_eq!(token.owner(), owner);
        assert_eq!(arbiter.current_owner(), Some(owner));
    }

    #[test]
    fn test_second_claim_evicts_first_exactly_once() {
        let arbiter = DeviceArbiter::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evictions);
        arbiter.claim(first, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        arbiter.claim(second, || {});

        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(arbiter.current_owner(), Some(second));
    }

    #[test]
    fn test_stale_release_is_noop() {
        let arbiter = DeviceArbiter::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        arbiter.claim(first, || {});
        arbiter.claim(second, || {});

        assert!(!arbiter.release(first));
        assert_eq!(arbiter.current_owner(), Some(second));

        assert!(arbiter.release(second));
        assert_eq!(arbiter.current_owner(), None);
    }

    #[test]
    fn test_same_owner_reclaim_does_not_self_evict() {
        let arbiter = DeviceArbiter::new();
        let owner = Uuid::new_v4();

        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evictions);
        arbiter.claim(owner, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        arbiter.claim(owner, || {});

        assert_eq!(evictions.load(Ordering::SeqCst), 0);
        assert_eq!(arbiter.current_owner(), Some(owner));
    }

    #[test]
    fn test_eviction_handler_may_release_without_deadlock() {
        let arbiter = Arc::new(DeviceArbiter::new());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let for_handler = Arc::clone(&arbiter);
        arbiter.claim(first, move || {
            // Teardown path: the evicted session releases its own token.
            for_handler.release(first);
        });

        arbiter.claim(second, || {});
        assert_eq!(arbiter.current_owner(), Some(second));
    }
}
