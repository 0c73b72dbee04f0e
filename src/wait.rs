//! Blocking multi-event wait.
//!
//! # Protocol
//!
//! ```text
//!  lock table ──► validate ids ──► snapshot `signaled` (consume auto-reset)
//!                                      │
//!                          satisfied? ─┤── yes ─────────────────────┐
//!                                      │ no                         │
//!                       register waiters, unlock                    │
//!                                      │                            │
//!        ┌──────► interruption? ── fatal: Fail / ordinary: Interrupted
//!        │             │ no                                         │
//!        │      re-check condition ── satisfied / event destroyed ──┤
//!        │             │ no                                         │
//!        └──── park until woken or deadline ── deadline passed ─────┤
//!                                                                   ▼
//!                          lock table, unregister, copy memory payloads
//! ```
//!
//! A waker fired between the condition check and `park` is not lost: the
//! waiter flags are flipped under the table lock before the wake, and
//! [`WaitContext::park`] returns immediately when a wake is pending.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use crate::event::{EventKind, EventPayload, MemoryExceptionData, Waiter};
use crate::table::{EventTable, TableInner};

/// Wakes a thread parked in [`WaitContext::park`].
pub trait ThreadWaker: Send + Sync {
    /// Wakes the thread, or makes its next `park` return immediately.
    fn wake(&self);
}

/// Interruption pending on a waiting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// Ordinary signal: the wait is aborted and may be restarted.
    Signal,
    /// The thread is being terminated.
    Fatal,
}

/// Scheduler services needed by a waiting thread.
pub trait WaitContext {
    /// Waker for the current thread.
    fn waker(&self) -> Arc<dyn ThreadWaker>;

    /// Monotonic time since an arbitrary fixed point.
    fn now(&self) -> Duration;

    /// Parks the current thread until woken or until `deadline` passes.
    ///
    /// May return spuriously. Must return immediately if a wake arrived
    /// since the previous `park`.
    fn park(&self, deadline: Option<Duration>);

    /// Interruption pending on the current thread, if any.
    fn pending_interruption(&self) -> Option<Interruption>;
}

/// How the events of a wait combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCombinator {
    /// Satisfied by any one event.
    Any,
    /// Satisfied only when every event is signaled.
    All,
}

/// How long a wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Never block.
    Immediate,
    /// Block for at most this many milliseconds.
    Millis(u32),
    /// Block until satisfied or interrupted.
    Infinite,
}

impl WaitTimeout {
    /// Raw timeout meaning "do not block".
    pub const IMMEDIATE_MS: u32 = 0;
    /// Raw timeout meaning "block forever".
    pub const INFINITE_MS: u32 = u32::MAX;

    /// Decodes a raw millisecond timeout with its two sentinels.
    pub fn from_millis(ms: u32) -> Self {
        match ms {
            Self::IMMEDIATE_MS => Self::Immediate,
            Self::INFINITE_MS => Self::Infinite,
            ms => Self::Millis(ms),
        }
    }
}

/// Outcome of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The combinator was satisfied.
    Complete,
    /// The timeout expired first.
    Timeout,
    /// An id was unknown, an event was destroyed during the wait, or the
    /// thread is being terminated.
    Fail,
    /// An ordinary interruption aborted the wait. The call may be repeated.
    Interrupted,
}

/// One entry of a wait call: the event to wait on and the buffer that
/// receives its memory exception data if it fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitRequest {
    pub event_id: u32,
    pub memory_exception_data: Option<MemoryExceptionData>,
}

impl WaitRequest {
    pub fn new(event_id: u32) -> Self {
        Self {
            event_id,
            memory_exception_data: None,
        }
    }
}

/// The waiters of one wait call.
///
/// Registered waiters are removed from their events when the set is
/// finished or dropped.
pub(crate) struct WaitSet<'a> {
    table: &'a EventTable,
    waiters: Vec<Arc<Waiter>>,
    registered: bool,
}

impl<'a> WaitSet<'a> {
    fn new(table: &'a EventTable, capacity: usize) -> Self {
        Self {
            table,
            waiters: Vec::with_capacity(capacity),
            registered: false,
        }
    }

    /// Evaluates the combinator over the current waiter flags.
    fn condition(&self, combinator: WaitCombinator) -> WaitResult {
        let mut activated = 0;
        for waiter in &self.waiters {
            if waiter.is_detached() {
                return WaitResult::Fail;
            }
            if waiter.is_activated() {
                if combinator == WaitCombinator::Any {
                    return WaitResult::Complete;
                }
                activated += 1;
            }
        }

        if activated == self.waiters.len() {
            WaitResult::Complete
        } else {
            WaitResult::Timeout
        }
    }

    fn register(&mut self, inner: &mut TableInner) {
        for waiter in self.waiters.iter().filter(|w| !w.is_activated()) {
            if let Some(event) = inner.event_mut(waiter.event_id()) {
                event.add_waiter(waiter);
            }
        }
        self.registered = true;
    }

    fn unregister(&mut self, inner: &mut TableInner) {
        if !self.registered {
            return;
        }
        for waiter in self.waiters.iter().filter(|w| !w.is_detached()) {
            if let Some(event) = inner.event_mut(waiter.event_id()) {
                if event.serial() == waiter.serial() {
                    event.remove_waiter(waiter);
                }
            }
        }
        self.registered = false;
    }

    /// Copies the payload of every activated memory event into its request.
    fn copy_signaled_data(&self, inner: &TableInner, requests: &mut [WaitRequest]) {
        for (waiter, request) in self.waiters.iter().zip(requests.iter_mut()) {
            if !waiter.is_activated() {
                continue;
            }
            let Some(event) = inner.event(waiter.event_id()) else {
                continue;
            };
            if event.serial() != waiter.serial() || event.kind() != EventKind::Memory {
                continue;
            }
            if let EventPayload::Memory(data) = event.payload() {
                request.memory_exception_data = Some(*data);
            }
        }
    }

    fn finish(&mut self, requests: &mut [WaitRequest], copy_data: bool) {
        let mut inner = self.table.lock();
        self.unregister(&mut inner);
        if copy_data {
            self.copy_signaled_data(&inner, requests);
        }
    }
}

impl Drop for WaitSet<'_> {
    fn drop(&mut self) {
        if self.registered {
            let mut inner = self.table.lock();
            self.unregister(&mut inner);
        }
    }
}

impl EventTable {
    /// Blocks until the events in `requests` satisfy `combinator`.
    ///
    /// For every memory event that fired, its exception data is copied into
    /// the matching request.
    ///
    /// # Arguments
    ///
    /// * `requests` - Events to wait on, in order.
    /// * `combinator` - Any or all of them.
    /// * `timeout` - How long to block.
    /// * `ctx` - Scheduler services of the calling thread.
    pub fn wait_on_events(
        &self,
        requests: &mut [WaitRequest],
        combinator: WaitCombinator,
        timeout: WaitTimeout,
        ctx: &dyn WaitContext,
    ) -> WaitResult {
        if requests.is_empty() {
            return WaitResult::Fail;
        }

        let deadline = match timeout {
            WaitTimeout::Millis(ms) => Some(ctx.now() + Duration::from_millis(ms as u64)),
            WaitTimeout::Immediate | WaitTimeout::Infinite => None,
        };
        let waker = ctx.waker();
        let mut set = WaitSet::new(self, requests.len());

        {
            let mut inner = self.lock();

            // Validate everything before consuming any auto-reset state.
            if let Some(missing) = requests.iter().find(|r| inner.event(r.event_id).is_none()) {
                debug!("Wait on unknown event {:#x}", missing.event_id);
                return WaitResult::Fail;
            }

            for request in requests.iter() {
                if let Some(event) = inner.event_mut(request.event_id) {
                    let activated = event.take_signaled();
                    set.waiters.push(Arc::new(Waiter::new(
                        event.id(),
                        event.serial(),
                        activated,
                        Arc::clone(&waker),
                    )));
                }
            }

            let result = set.condition(combinator);
            if result != WaitResult::Timeout || timeout == WaitTimeout::Immediate {
                set.copy_signaled_data(&inner, requests);
                return result;
            }

            set.register(&mut inner);
        }

        let mut interrupted = false;
        let result = loop {
            match ctx.pending_interruption() {
                Some(Interruption::Fatal) => {
                    interrupted = true;
                    break WaitResult::Fail;
                }
                Some(Interruption::Signal) => {
                    interrupted = true;
                    break WaitResult::Interrupted;
                }
                None => {}
            }

            let result = set.condition(combinator);
            if result != WaitResult::Timeout {
                break result;
            }
            if deadline.is_some_and(|deadline| ctx.now() >= deadline) {
                break WaitResult::Timeout;
            }

            ctx.park(deadline);
        };

        set.finish(requests, !interrupted);
        trace!("Wait on {} event(s) finished: {:?}", requests.len(), result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventConfig;
    use core::cell::Cell;

    struct NoopWaker;

    impl ThreadWaker for NoopWaker {
        fn wake(&self) {}
    }

    /// Single-threaded context whose clock advances on every park.
    struct SteppingContext {
        now: Cell<Duration>,
        interruption: Cell<Option<Interruption>>,
        parks: Cell<usize>,
    }

    impl SteppingContext {
        fn new() -> Self {
            Self {
                now: Cell::new(Duration::ZERO),
                interruption: Cell::new(None),
                parks: Cell::new(0),
            }
        }
    }

    impl WaitContext for SteppingContext {
        fn waker(&self) -> Arc<dyn ThreadWaker> {
            Arc::new(NoopWaker)
        }

        fn now(&self) -> Duration {
            self.now.get()
        }

        fn park(&self, _deadline: Option<Duration>) {
            self.parks.set(self.parks.get() + 1);
            self.now.set(self.now.get() + Duration::from_millis(10));
        }

        fn pending_interruption(&self) -> Option<Interruption> {
            self.interruption.get()
        }
    }

    fn table_with_signals(n: usize, auto_reset: bool) -> EventTable {
        let table = EventTable::new(EventConfig::default());
        for _ in 0..n {
            table.create_event(EventKind::Signal, auto_reset, None).unwrap();
        }
        table
    }

    fn requests(ids: &[u32]) -> Vec<WaitRequest> {
        ids.iter().map(|&id| WaitRequest::new(id)).collect()
    }

    #[test]
    fn test_timeout_sentinels() {
        assert_eq!(WaitTimeout::from_millis(0), WaitTimeout::Immediate);
        assert_eq!(WaitTimeout::from_millis(u32::MAX), WaitTimeout::Infinite);
        assert_eq!(WaitTimeout::from_millis(5), WaitTimeout::Millis(5));
    }

    #[test]
    fn test_all_needs_every_event() {
        let table = table_with_signals(2, false);
        table.set_event(1).unwrap();
        let ctx = SteppingContext::new();

        let mut reqs = requests(&[0, 1]);
        let result = table.wait_on_events(&mut reqs, WaitCombinator::All, WaitTimeout::Immediate, &ctx);
        assert_eq!(result, WaitResult::Timeout);
        assert_eq!(ctx.parks.get(), 0);
    }

    #[test]
    fn test_any_consumes_auto_reset() {
        let table = table_with_signals(2, true);
        table.set_event(1).unwrap();
        let ctx = SteppingContext::new();

        let mut reqs = requests(&[0, 1]);
        let result = table.wait_on_events(&mut reqs, WaitCombinator::Any, WaitTimeout::Immediate, &ctx);
        assert_eq!(result, WaitResult::Complete);
        assert!(!table.lookup(1).unwrap().signaled);

        // Nothing left to observe
        let result = table.wait_on_events(&mut reqs, WaitCombinator::Any, WaitTimeout::Immediate, &ctx);
        assert_eq!(result, WaitResult::Timeout);
    }

    #[test]
    fn test_manual_reset_stays_signaled() {
        let table = table_with_signals(1, false);
        table.set_event(0).unwrap();
        let ctx = SteppingContext::new();

        let mut reqs = requests(&[0]);
        for _ in 0..2 {
            let result = table.wait_on_events(&mut reqs, WaitCombinator::Any, WaitTimeout::Immediate, &ctx);
            assert_eq!(result, WaitResult::Complete);
        }
    }

    #[test]
    fn test_unknown_id_fails_without_consuming() {
        let table = table_with_signals(1, true);
        table.set_event(0).unwrap();
        let ctx = SteppingContext::new();

        let mut reqs = requests(&[0, 42]);
        let result = table.wait_on_events(&mut reqs, WaitCombinator::Any, WaitTimeout::Infinite, &ctx);
        assert_eq!(result, WaitResult::Fail);
        assert!(table.lookup(0).unwrap().signaled);

        let result = table.wait_on_events(&mut [], WaitCombinator::Any, WaitTimeout::Immediate, &ctx);
        assert_eq!(result, WaitResult::Fail);
    }

    #[test]
    fn test_finite_timeout_uses_deadline() {
        let table = table_with_signals(1, false);
        let ctx = SteppingContext::new();

        let mut reqs = requests(&[0]);
        let result = table.wait_on_events(&mut reqs, WaitCombinator::Any, WaitTimeout::Millis(35), &ctx);
        assert_eq!(result, WaitResult::Timeout);
        assert_eq!(ctx.parks.get(), 4);

        // Waiters are gone afterwards
        assert_eq!(table.lock().event(0).unwrap().waiter_count(), 0);
    }

    #[test]
    fn test_interruptions() {
        let table = table_with_signals(1, false);
        let ctx = SteppingContext::new();
        let mut reqs = requests(&[0]);

        ctx.interruption.set(Some(Interruption::Signal));
        let result = table.wait_on_events(&mut reqs, WaitCombinator::Any, WaitTimeout::Infinite, &ctx);
        assert_eq!(result, WaitResult::Interrupted);

        ctx.interruption.set(Some(Interruption::Fatal));
        let result = table.wait_on_events(&mut reqs, WaitCombinator::Any, WaitTimeout::Infinite, &ctx);
        assert_eq!(result, WaitResult::Fail);
        assert_eq!(table.lock().event(0).unwrap().waiter_count(), 0);
    }

    #[test]
    fn test_memory_payload_copied() {
        let table = EventTable::new(EventConfig::default());
        let signal = table.create_event(EventKind::Signal, false, None).unwrap();
        let memory = table.create_event(EventKind::Memory, false, None).unwrap();
        let data = MemoryExceptionData {
            gpu_id: 7,
            va: 0x1000,
            ..Default::default()
        };
        {
            let mut inner = table.lock();
            let event = inner.event_mut(memory).unwrap();
            event.set_payload(EventPayload::Memory(data));
            event.set();
        }

        let ctx = SteppingContext::new();
        let mut reqs = requests(&[signal, memory]);
        let result = table.wait_on_events(&mut reqs, WaitCombinator::Any, WaitTimeout::Immediate, &ctx);
        assert_eq!(result, WaitResult::Complete);
        assert_eq!(reqs[0].memory_exception_data, None);
        assert_eq!(reqs[1].memory_exception_data, Some(data));
    }
}
