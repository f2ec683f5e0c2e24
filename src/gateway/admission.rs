use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::GatewayError;

struct Shared {
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    /// Permits still to be retired once their current holders finish.
    retire: AtomicUsize,
    in_flight: AtomicUsize,
}

impl Shared {
    fn claim_retire(&self) -> bool {
        self.retire
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Bounds in-flight backend calls. Acquisition never waits.
///
/// Capacity can only go down at runtime. Lowering it retires free permits at once and
/// the rest as their holders release them, so calls already admitted run to completion.
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity: AtomicUsize::new(capacity),
                retire: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn try_acquire(&self) -> Result<AdmissionPermit, GatewayError> {
        let permit = Arc::clone(&self.shared.semaphore)
            .try_acquire_owned()
            .map_err(|_| GatewayError::OverCapacity)?;
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(AdmissionPermit {
            permit: Some(permit),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Lowers capacity to `to` (at least 1). Returns `false` when capacity is already at
    /// or below `to`; raising it back needs a restart.
    pub fn lower_capacity(&self, to: usize) -> bool {
        let to = to.max(1);
        let previous = self
            .shared
            .capacity
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current > to).then_some(to)
            });
        let Ok(previous) = previous else {
            return false;
        };

        // Publish the whole reduction first so no release in between returns a permit
        // that should have been retired. Each retire unit is then spent exactly once,
        // either here on a free permit or by a holder on its own.
        self.shared
            .retire
            .fetch_add(previous - to, Ordering::SeqCst);
        self.retire_free_permits();
        tracing::warn!(from = previous, to, "lowered admission capacity");
        true
    }

    fn retire_free_permits(&self) {
        while self.shared.claim_retire() {
            if self.shared.semaphore.forget_permits(1) == 1 {
                continue;
            }
            self.shared.retire.fetch_add(1, Ordering::SeqCst);
            // A holder may have released while the unit was claimed; its permit is free now.
            if self.shared.semaphore.available_permits() == 0 {
                break;
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.shared.semaphore.available_permits()
    }
}

/// Releases its slot when dropped, on every exit path including unwinding.
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let _ = self
            .shared
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        let Some(permit) = self.permit.take() else {
            return;
        };
        if self.shared.claim_retire() {
            permit.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_immediately_when_full() {
        let admission = AdmissionController::new(2);
        let first = admission.try_acquire().unwrap();
        let _second = admission.try_acquire().unwrap();
        assert!(matches!(
            admission.try_acquire().unwrap_err(),
            GatewayError::OverCapacity
        ));
        assert_eq!(admission.in_flight(), 2);

        drop(first);
        assert_eq!(admission.in_flight(), 1);
        admission.try_acquire().unwrap();
    }

    #[test]
    fn lowering_leaves_holders_alone_and_caps_new_work() {
        let admission = AdmissionController::new(5);
        let held: Vec<_> = (0..4).map(|_| admission.try_acquire().unwrap()).collect();

        assert!(admission.lower_capacity(3));
        assert_eq!(admission.capacity(), 3);
        assert_eq!(admission.in_flight(), 4);
        assert_eq!(admission.available(), 0);
        assert!(admission.try_acquire().is_err());

        drop(held);
        assert_eq!(admission.available(), 3);
        let _again: Vec<_> = (0..3).map(|_| admission.try_acquire().unwrap()).collect();
        assert!(admission.try_acquire().is_err());
    }

    #[test]
    fn capacity_never_rises() {
        let admission = AdmissionController::new(3);
        assert!(!admission.lower_capacity(3));
        assert!(!admission.lower_capacity(10));
        assert!(admission.lower_capacity(0));
        assert_eq!(admission.capacity(), 1);
    }

    #[test]
    fn releases_racing_a_reduction_never_exceed_the_new_capacity() {
        for _ in 0..50 {
            let admission = Arc::new(AdmissionController::new(8));
            let held: Vec<_> = (0..6).map(|_| admission.try_acquire().unwrap()).collect();

            let releaser = std::thread::spawn(move || drop(held));
            assert!(admission.lower_capacity(2));
            releaser.join().unwrap();

            assert_eq!(admission.in_flight(), 0);
            assert_eq!(admission.available(), 2);
            let _full: Vec<_> = (0..2).map(|_| admission.try_acquire().unwrap()).collect();
            assert!(admission.try_acquire().is_err());
        }
    }
}
