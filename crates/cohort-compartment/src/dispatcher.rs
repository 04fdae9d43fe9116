//! Blocking/wakeup strategies for compartment threads.
//!
//! A dispatcher decides how an idle compartment waits for work. The same
//! compartment can either sleep on a condition variable or multiplex its
//! idle time with an I/O readiness loop:
//!
//! - [`SimpleCompartmentDispatcher`] - condition variable wait/notify
//! - [`SelectorCompartmentDispatcher`] - waits in a `polling::Poller` and
//!   hands readiness events to an external [`ReadinessHandler`]

use parking_lot::{Condvar, Mutex};
use polling::{Event as PollEvent, Poller};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Suspends and resumes a compartment's worker thread.
pub trait CompartmentDispatcher: Send + Sync {
    /// Suspend the calling thread until woken or until `period` elapses.
    fn block(&self, period: Duration);

    /// Wake a blocked worker. Idempotent and non-blocking.
    fn wakeup(&self);

    /// Check whether the run loop may exit.
    fn can_finish(&self, stop_requested: bool) -> bool {
        stop_requested
    }

    /// Check whether tasks offered from the compartment's own thread may be
    /// executed inline.
    fn supports_direct_calls(&self) -> bool {
        false
    }
}

/// Wait/notify dispatcher.
#[derive(Default)]
pub struct SimpleCompartmentDispatcher {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl SimpleCompartmentDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompartmentDispatcher for SimpleCompartmentDispatcher {
    fn block(&self, period: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.condvar.wait_for(&mut woken, period);
        }
        *woken = false;
    }

    fn wakeup(&self) {
        let mut woken = self.woken.lock();
        if !*woken {
            *woken = true;
            self.condvar.notify_one();
        }
    }
}

impl fmt::Debug for SimpleCompartmentDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleCompartmentDispatcher")
            .field("woken", &*self.woken.lock())
            .finish()
    }
}

/// External I/O loop driven from a compartment's idle time.
pub trait ReadinessHandler: Send + Sync {
    /// Handle readiness events returned by the poller.
    fn on_ready(&self, poller: &Poller, events: &[PollEvent]);

    /// Check whether the I/O loop has released everything it owns.
    fn can_finish(&self) -> bool {
        true
    }
}

/// Dispatcher that cooperates with an I/O readiness loop.
///
/// Idle waits happen inside `Poller::wait`, so socket readiness and queued
/// work both wake the compartment. Wakeups use `Poller::notify`.
pub struct SelectorCompartmentDispatcher {
    poller: Poller,
    handler: Arc<dyn ReadinessHandler>,
    events: Mutex<Vec<PollEvent>>,
    woken: AtomicBool,
}

impl SelectorCompartmentDispatcher {
    pub fn new(handler: Arc<dyn ReadinessHandler>) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            handler,
            events: Mutex::new(Vec::new()),
            woken: AtomicBool::new(false),
        })
    }

    /// The poller sources are registered with.
    pub fn poller(&self) -> &Poller {
        &self.poller
    }
}

impl CompartmentDispatcher for SelectorCompartmentDispatcher {
    fn block(&self, period: Duration) {
        let mut events = self.events.lock();
        events.clear();
        if let Err(e) = self.poller.wait(&mut events, Some(period)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!(error = %e, "Poller wait failed");
            }
        }
        self.woken.store(false, Ordering::Release);

        if !events.is_empty() {
            self.handler.on_ready(&self.poller, &events);
        }
    }

    fn wakeup(&self) {
        if !self.woken.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.poller.notify() {
                warn!(error = %e, "Poller notify failed");
            }
        }
    }

    fn can_finish(&self, stop_requested: bool) -> bool {
        stop_requested && self.handler.can_finish()
    }

    fn supports_direct_calls(&self) -> bool {
        true
    }
}

impl fmt::Debug for SelectorCompartmentDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorCompartmentDispatcher")
            .field("woken", &self.woken.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    struct IdleHandler {
        finished: AtomicBool,
    }

    impl ReadinessHandler for IdleHandler {
        fn on_ready(&self, _poller: &Poller, _events: &[PollEvent]) {}

        fn can_finish(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_simple_dispatcher_times_out() {
        let dispatcher = SimpleCompartmentDispatcher::new();
        let start = Instant::now();
        dispatcher.block(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_simple_dispatcher_pending_wakeup_returns_immediately() {
        let dispatcher = SimpleCompartmentDispatcher::new();
        dispatcher.wakeup();
        dispatcher.wakeup();

        let start = Instant::now();
        dispatcher.block(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_simple_dispatcher_wakeup_from_other_thread() {
        let dispatcher = Arc::new(SimpleCompartmentDispatcher::new());
        let waker = dispatcher.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wakeup();
        });

        let start = Instant::now();
        dispatcher.block(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_selector_dispatcher_wakeup() {
        let handler = Arc::new(IdleHandler {
            finished: AtomicBool::new(false),
        });
        let dispatcher = SelectorCompartmentDispatcher::new(handler.clone()).unwrap();
        assert!(dispatcher.supports_direct_calls());

        dispatcher.wakeup();
        let start = Instant::now();
        dispatcher.block(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(!dispatcher.can_finish(true));
        handler.finished.store(true, Ordering::SeqCst);
        assert!(dispatcher.can_finish(true));
        assert!(!dispatcher.can_finish(false));
    }
}
