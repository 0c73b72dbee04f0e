//! [`WaitContext`] for hosted builds, backed by `std::thread` parking.
//!
//! The waiting thread is resolved when a wait asks for its waker, so a
//! context may be created on one thread and used on another.

extern crate std;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};
use core::time::Duration;
use std::thread::{self, Thread};
use std::time::Instant;

use spin::Mutex;

use crate::wait::{Interruption, ThreadWaker, WaitContext};

const NO_INTERRUPTION: u8 = 0;
const SIGNAL_PENDING: u8 = 1;
const FATAL_PENDING: u8 = 2;

impl ThreadWaker for Thread {
    fn wake(&self) {
        self.unpark();
    }
}

/// Wait context backed by the parking of the thread that waits through it.
pub struct StdWaitContext {
    /// Thread that last started a wait, initially the creator.
    waiter: Arc<Mutex<Thread>>,
    epoch: Instant,
    interruption: Arc<AtomicU8>,
}

impl StdWaitContext {
    /// Creates a context for the calling thread.
    pub fn current() -> Self {
        Self {
            waiter: Arc::new(Mutex::new(thread::current())),
            epoch: Instant::now(),
            interruption: Arc::new(AtomicU8::new(NO_INTERRUPTION)),
        }
    }

    /// Handle other threads use to interrupt the waiting thread.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            waiter: Arc::clone(&self.waiter),
            interruption: Arc::clone(&self.interruption),
        }
    }
}

impl WaitContext for StdWaitContext {
    /// Wakes the calling thread, the one that will `park`.
    fn waker(&self) -> Arc<dyn ThreadWaker> {
        let thread = thread::current();
        *self.waiter.lock() = thread.clone();
        Arc::new(thread)
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn park(&self, deadline: Option<Duration>) {
        match deadline {
            None => thread::park(),
            Some(deadline) => {
                let now = self.now();
                if deadline > now {
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    /// A pending ordinary signal is delivered once; termination stays pending.
    fn pending_interruption(&self) -> Option<Interruption> {
        match self.interruption.load(Ordering::Acquire) {
            FATAL_PENDING => Some(Interruption::Fatal),
            SIGNAL_PENDING => self
                .interruption
                .compare_exchange(SIGNAL_PENDING, NO_INTERRUPTION, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| Interruption::Signal),
            _ => None,
        }
    }
}

/// Raises interruptions on a thread waiting through a [`StdWaitContext`].
#[derive(Clone)]
pub struct Interrupter {
    waiter: Arc<Mutex<Thread>>,
    interruption: Arc<AtomicU8>,
}

impl Interrupter {
    /// Marks `kind` pending and wakes the thread.
    pub fn interrupt(&self, kind: Interruption) {
        let value = match kind {
            Interruption::Signal => SIGNAL_PENDING,
            Interruption::Fatal => FATAL_PENDING,
        };
        self.interruption.fetch_max(value, Ordering::AcqRel);
        self.waiter.lock().unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_delivered_once() {
        let ctx = StdWaitContext::current();
        ctx.interrupter().interrupt(Interruption::Signal);
        assert_eq!(ctx.pending_interruption(), Some(Interruption::Signal));
        assert_eq!(ctx.pending_interruption(), None);
    }

    #[test]
    fn test_fatal_is_sticky() {
        let ctx = StdWaitContext::current();
        let interrupter = ctx.interrupter();
        interrupter.interrupt(Interruption::Fatal);
        interrupter.interrupt(Interruption::Signal);
        assert_eq!(ctx.pending_interruption(), Some(Interruption::Fatal));
        assert_eq!(ctx.pending_interruption(), Some(Interruption::Fatal));
    }

    #[test]
    fn test_waker_follows_waiting_thread() {
        let ctx = StdWaitContext::current();
        let interrupter = ctx.interrupter();

        let handle = thread::spawn(move || {
            let _waker = ctx.waker();
            ctx
        });
        let waiter = handle.thread().id();
        let ctx = handle.join().unwrap();

        assert_eq!(ctx.waiter.lock().id(), waiter);
        assert_eq!(interrupter.waiter.lock().id(), waiter);
    }

    #[test]
    fn test_park_honors_deadline() {
        let ctx = StdWaitContext::current();
        let deadline = ctx.now() + Duration::from_millis(5);
        while ctx.now() < deadline {
            ctx.park(Some(deadline));
        }
        assert!(ctx.now() >= deadline);
    }
}
