use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Lifecycle states of a deferred-close service.
///
/// Every service in the handle/log graph (manager, physical log, logical log, and their
/// handles) moves through the same four states.  `Open` is the only state in which
/// operations may execute, and the transition from `Open` to `ClosePending` is deferred
/// until every outstanding activity has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Constructed,
    Open,
    ClosePending,
    Closed,
}

/// What the caller of [`ServiceLifecycle::begin_close`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BeginClose {
    /// No activities are outstanding: the caller runs the close task now.
    Run,
    /// Activities are outstanding: the caller waits for them to drain, then runs the
    /// close task.
    Drain,
    /// Another caller already requested close: wait for the close to complete.
    AlreadyRequested,
    /// The service never opened, or has already fully closed.
    NotOpen,
}

struct LifecycleState {
    state: ServiceState,
    close_requested: bool,
}

/// Deferred-close coordination shared by a service and its consumers.
///
/// Activities are ref-count-like tokens: a consumer that holds one keeps the service's
/// close task from running.  Closing marks the service as close-requested; once the
/// activity count reaches zero the close task runs exactly once, and every close caller
/// observes completion through the close awaiter.
pub(crate) struct ServiceLifecycle {
    inner: Mutex<LifecycleState>,
    activities: AtomicUsize,
    drained: Notify,
    closed: Notify,
}

impl ServiceLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LifecycleState {
                state: ServiceState::Constructed,
                close_requested: false,
            }),
            activities: AtomicUsize::new(0),
            drained: Notify::new(),
            closed: Notify::new(),
        })
    }

    /// Transitions `Constructed -> Open`.  Panics on reuse; services open once.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, ServiceState::Constructed);
        inner.state = ServiceState::Open;
    }

    /// Whether the service is open (close may have been requested but not completed).
    pub fn is_open(&self) -> bool {
        self.inner.lock().state == ServiceState::Open
    }

    /// Atomically checks that the service is open and not yet asked to close, and on
    /// success increments the activity count.
    ///
    /// The returned guard releases the activity when dropped; a release that brings the
    /// count to zero while a close is pending wakes the close task.
    pub fn try_acquire_activity(self: &Arc<Self>) -> Option<ActivityGuard> {
        let inner = self.inner.lock();
        if inner.state != ServiceState::Open || inner.close_requested {
            return None;
        }
        self.activities.fetch_add(1, Ordering::AcqRel);
        Some(ActivityGuard {
            lifecycle: Arc::clone(self),
        })
    }

    fn release_activity(&self) {
        let previous = self.activities.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "activity released without acquire");
        if previous == 1 && self.inner.lock().close_requested {
            self.drained.notify_waiters();
        }
    }

    /// Marks the service close-requested and reports what the caller must do to finish
    /// the close.
    pub fn begin_close(&self) -> BeginClose {
        let mut inner = self.inner.lock();
        match inner.state {
            ServiceState::Constructed | ServiceState::Closed => BeginClose::NotOpen,
            ServiceState::ClosePending => BeginClose::AlreadyRequested,
            ServiceState::Open => {
                if inner.close_requested {
                    return BeginClose::AlreadyRequested;
                }
                inner.close_requested = true;
                if self.activities.load(Ordering::Acquire) == 0 {
                    inner.state = ServiceState::ClosePending;
                    BeginClose::Run
                } else {
                    BeginClose::Drain
                }
            }
        }
    }

    /// Waits until all activities acquired before the close request have been released,
    /// then claims the `ClosePending` transition for the caller.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let mut inner = self.inner.lock();
                debug_assert!(inner.close_requested);
                if self.activities.load(Ordering::Acquire) == 0 {
                    inner.state = ServiceState::ClosePending;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Transitions `ClosePending -> Closed` and completes the close awaiter.
    pub fn finish_close(&self) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, ServiceState::ClosePending);
        inner.state = ServiceState::Closed;
        drop(inner);
        self.closed.notify_waiters();
    }

    /// Waits until a concurrent close completes.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.inner.lock().state == ServiceState::Closed {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ServiceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ServiceLifecycle")
            .field("state", &inner.state)
            .field("close_requested", &inner.close_requested)
            .field("activities", &self.activities.load(Ordering::Acquire))
            .finish()
    }
}

/// An acquired activity.  Dropping it releases the activity; if that was the last one
/// and a close is pending, the close task is woken.
pub(crate) struct ActivityGuard {
    lifecycle: Arc<ServiceLifecycle>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.lifecycle.release_activity();
    }
}

impl std::fmt::Debug for ActivityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_waits_for_activities() {
        let lifecycle = ServiceLifecycle::new();
        lifecycle.open();

        let activity = lifecycle.try_acquire_activity().expect("service is open");
        assert_eq!(lifecycle.begin_close(), BeginClose::Drain);

        // New activities must be refused once close has been requested.
        assert!(lifecycle.try_acquire_activity().is_none());

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move {
                lifecycle.wait_drained().await;
                lifecycle.finish_close();
            })
        };

        drop(activity);
        waiter.await.expect("close task should not panic");
        assert!(!lifecycle.is_open());
    }

    #[tokio::test]
    async fn immediate_close_when_idle() {
        let lifecycle = ServiceLifecycle::new();
        lifecycle.open();
        assert_eq!(lifecycle.begin_close(), BeginClose::Run);
        lifecycle.finish_close();
        assert_eq!(lifecycle.begin_close(), BeginClose::NotOpen);
    }

    #[tokio::test]
    async fn concurrent_close_observes_completion() {
        let lifecycle = ServiceLifecycle::new();
        lifecycle.open();

        assert_eq!(lifecycle.begin_close(), BeginClose::Run);
        assert_eq!(lifecycle.begin_close(), BeginClose::AlreadyRequested);

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_closed().await })
        };

        lifecycle.finish_close();
        waiter.await.expect("waiter should not panic");
    }
}
