//! One-shot permission plumbing.
//!
//! A permission request registers a pair of callbacks in a shared slot and
//! hands the host a `PermissionResponder`. Whichever thread the host answers
//! on, the callbacks are taken out of the slot under its mutex, so each
//! registration fires at most one of them. Releasing the listener, or
//! registering a new one, makes any earlier responder stale.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Answer delivered by the host for a permission prompt.
#[derive(Debug, Clone)]
pub struct PermissionResult<D> {
    /// Device the answer refers to, if the host supplied one.
    pub device: Option<D>,
    pub granted: bool,
}

/// Outcome seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
}

impl fmt::Display for PermissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionOutcome::Granted => write!(f, "granted"),
            PermissionOutcome::Denied => write!(f, "denied"),
        }
    }
}

struct PendingPermission {
    on_granted: Callback,
    on_denied: Callback,
}

#[derive(Default)]
struct SlotState {
    generation: u64,
    pending: Option<PendingPermission>,
}

fn lock(state: &Mutex<SlotState>) -> MutexGuard<'_, SlotState> {
    // Callbacks never run under the lock, so a poisoned slot still holds
    // consistent state.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Holder for the single outstanding permission listener of a session.
#[derive(Clone, Default)]
pub struct PermissionSlot {
    state: Arc<Mutex<SlotState>>,
}

impl PermissionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register callbacks and return the responder the host must fulfill.
    ///
    /// A listener that is still pending is superseded and will never fire.
    pub fn register<D, G, N>(&self, on_granted: G, on_denied: N) -> PermissionResponder<D>
    where
        G: FnOnce() + Send + 'static,
        N: FnOnce() + Send + 'static,
    {
        let mut state = lock(&self.state);
        if state.pending.is_some() {
            warn!("Superseding pending permission listener");
        }
        state.generation += 1;
        state.pending = Some(PendingPermission {
            on_granted: Box::new(on_granted),
            on_denied: Box::new(on_denied),
        });
        PermissionResponder {
            state: Arc::clone(&self.state),
            generation: state.generation,
            _device: PhantomData,
        }
    }

    /// Drop the pending listener, if any. Returns whether one was pending.
    pub fn release(&self) -> bool {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.pending.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }
}

/// One-shot handle the host uses to answer a permission request.
pub struct PermissionResponder<D> {
    state: Arc<Mutex<SlotState>>,
    generation: u64,
    _device: PhantomData<fn() -> D>,
}

impl<D: fmt::Debug> PermissionResponder<D> {
    /// Deliver the host's answer. Returns `true` if a callback ran.
    ///
    /// Granted with a device runs `on_granted`; anything else runs
    /// `on_denied`. Stale or already-answered responders do nothing.
    pub fn deliver(self, result: PermissionResult<D>) -> bool {
        let pending = {
            let mut state = lock(&self.state);
            if state.generation != self.generation {
                debug!(
                    generation = self.generation,
                    "Ignoring permission result for released listener"
                );
                return false;
            }
            state.pending.take()
        };

        let Some(pending) = pending else {
            debug!("Permission result already handled");
            return false;
        };

        match (result.granted, &result.device) {
            (true, Some(device)) => {
                debug!(device = ?device, "Permission granted");
                (pending.on_granted)();
            }
            _ => {
                debug!(
                    granted = result.granted,
                    has_device = result.device.is_some(),
                    "Permission denied for device"
                );
                (pending.on_denied)();
            }
        }
        true
    }

    pub fn grant(self, device: D) -> bool {
        self.deliver(PermissionResult {
            device: Some(device),
            granted: true,
        })
    }

    pub fn deny(self, device: Option<D>) -> bool {
        self.deliver(PermissionResult {
            device,
            granted: false,
        })
    }
}

impl<D> fmt::Debug for PermissionResponder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionResponder")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    fn register(
        slot: &PermissionSlot,
        granted: &Arc<AtomicUsize>,
        denied: &Arc<AtomicUsize>,
    ) -> PermissionResponder<&'static str> {
        let g = Arc::clone(granted);
        let d = Arc::clone(denied);
        slot.register(
            move || {
                g.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                d.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[test]
    fn test_grant_with_device() {
        let slot = PermissionSlot::new();
        let (granted, denied) = counters();
        let responder = register(&slot, &granted, &denied);

        assert!(slot.is_pending());
        assert!(responder.grant("dev"));
        assert_eq!(granted.load(Ordering::SeqCst), 1);
        assert_eq!(denied.load(Ordering::SeqCst), 0);
        assert!(!slot.is_pending());
    }

    #[test]
    fn test_granted_without_device_is_denied() {
        let slot = PermissionSlot::new();
        let (granted, denied) = counters();
        let responder = register(&slot, &granted, &denied);

        responder.deliver(PermissionResult {
            device: None,
            granted: true,
        });
        assert_eq!(granted.load(Ordering::SeqCst), 0);
        assert_eq!(denied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_is_idempotent_and_silences_responder() {
        let slot = PermissionSlot::new();
        let (granted, denied) = counters();
        let responder = register(&slot, &granted, &denied);

        assert!(slot.release());
        assert!(!slot.release());
        assert!(!responder.grant("dev"));
        assert_eq!(granted.load(Ordering::SeqCst), 0);
        assert_eq!(denied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_superseded_responder_is_stale() {
        let slot = PermissionSlot::new();
        let (granted, denied) = counters();
        let first = register(&slot, &granted, &denied);
        let second = register(&slot, &granted, &denied);

        assert!(!first.deny(None));
        assert!(second.deny(None));
        assert_eq!(denied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_release_slot() {
        let slot = PermissionSlot::new();
        let inner = slot.clone();
        let responder: PermissionResponder<u8> = slot.register(
            move || {
                inner.release();
            },
            || {},
        );
        assert!(responder.grant(1));
    }

    #[test]
    fn test_delivery_from_other_thread() {
        let slot = PermissionSlot::new();
        let (granted, denied) = counters();
        let responder = register(&slot, &granted, &denied);

        thread::spawn(move || responder.deny(Some("dev")))
            .join()
            .unwrap();
        assert_eq!(denied.load(Ordering::SeqCst), 1);
    }
}
