//! Event entity and its signal state machine.
//!
//! An event is either *unsignaled* or *signaled*. [`Event::set`] activates
//! every registered waiter and leaves the persistent flag set only when the
//! event is manual-reset or nobody was waiting. An auto-reset event that woke
//! a waiter is considered consumed by that waiter; one that woke nobody stays
//! signaled until a later wait observes it.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::wait::ThreadWaker;

/// Event types, with the codes used on the wire and in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum EventKind {
    /// Signaled by the device through a signal slot, or by the CPU.
    Signal = 0,
    /// Topology change.
    NodeChange = 1,
    /// Device state change.
    DeviceStateChange = 2,
    /// Device reset or hang.
    HwException = 3,
    /// System event.
    System = 4,
    /// Debugger notification, signaled by the device through a slot.
    Debug = 5,
    /// Profiling event.
    Profile = 6,
    /// Queue event.
    Queue = 7,
    /// GPU memory fault.
    Memory = 8,
}

impl EventKind {
    /// Decodes a wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Signal,
            1 => Self::NodeChange,
            2 => Self::DeviceStateChange,
            3 => Self::HwException,
            4 => Self::System,
            5 => Self::Debug,
            6 => Self::Profile,
            7 => Self::Queue,
            8 => Self::Memory,
            _ => return None,
        })
    }

    /// Wire value of this kind.
    #[inline]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Kinds whose id is a signal slot index. These are also the kinds the
    /// device may signal.
    #[inline]
    pub fn uses_signal_slot(self) -> bool {
        matches!(self, Self::Signal | Self::Debug)
    }

    /// Kinds userspace may set or reset directly.
    #[inline]
    pub fn is_cpu_signalable(self) -> bool {
        self == Self::Signal
    }
}

/// Why a memory access faulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryFailure {
    /// The page was not present.
    pub not_present: bool,
    /// The access was a write to a read-only page.
    pub read_only: bool,
    /// The access was an instruction fetch from a no-execute page.
    pub no_execute: bool,
    /// The faulting address is not exact.
    pub imprecise: bool,
}

/// Class of a memory error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryErrorType {
    /// Plain page fault.
    #[default]
    None = 0,
    /// Uncorrectable ECC error in on-chip SRAM.
    SramEcc = 1,
    /// Poisoned memory was consumed.
    PoisonConsumed = 2,
}

impl MemoryErrorType {
    /// Decodes a wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::SramEcc),
            2 => Some(Self::PoisonConsumed),
            _ => None,
        }
    }
}

/// Payload of a memory event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryExceptionData {
    /// User-visible id of the faulting GPU.
    pub gpu_id: u32,
    /// Faulting virtual address.
    pub va: u64,
    /// Fault classification.
    pub failure: MemoryFailure,
    /// Error class.
    pub error_type: MemoryErrorType,
}

/// Cause of a device reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum ResetCause {
    /// The GPU hung.
    #[default]
    GpuHang = 0,
    /// An uncorrectable ECC error forced the reset.
    Ecc = 1,
}

impl ResetCause {
    /// Decodes a wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::GpuHang),
            1 => Some(Self::Ecc),
            _ => None,
        }
    }
}

/// `reset_type` for a whole-device reset.
pub const RESET_TYPE_WHOLE_GPU: u32 = 0;

/// Payload of a hardware exception event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwExceptionData {
    /// Reset scope.
    pub reset_type: u32,
    /// Reset cause.
    pub reset_cause: ResetCause,
    /// Device memory contents were lost.
    pub memory_lost: bool,
    /// User-visible id of the reset GPU.
    pub gpu_id: u32,
}

/// Type-specific event payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventPayload {
    /// No payload.
    #[default]
    None,
    /// Memory fault description.
    Memory(MemoryExceptionData),
    /// Reset description.
    HwException(HwExceptionData),
}

/// A copy of an event's observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    pub id: u32,
    pub kind: EventKind,
    pub auto_reset: bool,
    pub signaled: bool,
    pub payload: EventPayload,
}

/// One thread's registration on one event for the duration of a wait.
///
/// The event keeps only a weak reference; the wait call owns the waiter.
pub(crate) struct Waiter {
    event_id: u32,
    serial: u64,
    activated: AtomicBool,
    /// The event was destroyed while this waiter was registered.
    detached: AtomicBool,
    waker: Arc<dyn ThreadWaker>,
}

impl Waiter {
    pub(crate) fn new(event_id: u32, serial: u64, activated: bool, waker: Arc<dyn ThreadWaker>) -> Self {
        Self {
            event_id,
            serial,
            activated: AtomicBool::new(activated),
            detached: AtomicBool::new(false),
            waker,
        }
    }

    #[inline]
    pub(crate) fn event_id(&self) -> u32 {
        self.event_id
    }

    #[inline]
    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    #[inline]
    pub(crate) fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn activate(&self) {
        self.activated.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// A notification entity owned by an event table.
pub struct Event {
    id: u32,
    /// Table-unique creation number, distinguishes reuses of the same id.
    serial: u64,
    kind: EventKind,
    auto_reset: bool,
    signaled: bool,
    payload: EventPayload,
    waiters: Vec<Weak<Waiter>>,
}

impl Event {
    pub(crate) fn new(id: u32, serial: u64, kind: EventKind, auto_reset: bool) -> Self {
        Self {
            id,
            serial,
            kind,
            auto_reset,
            signaled: false,
            payload: EventPayload::None,
            waiters: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[inline]
    pub fn auto_reset(&self) -> bool {
        self.auto_reset
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    #[inline]
    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Number of waiters currently registered.
    pub fn waiter_count(&self) -> usize {
        self.waiters.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Copies out the observable state.
    pub fn info(&self) -> EventInfo {
        EventInfo {
            id: self.id,
            kind: self.kind,
            auto_reset: self.auto_reset,
            signaled: self.signaled,
            payload: self.payload,
        }
    }

    /// Signals the event and wakes every registered waiter.
    pub(crate) fn set(&mut self) {
        let mut woken = 0usize;
        self.waiters.retain(|weak| match weak.upgrade() {
            Some(waiter) => {
                waiter.activate();
                woken += 1;
                true
            }
            None => false,
        });

        // Auto reset if we woke someone.
        self.signaled = !self.auto_reset || woken == 0;
        trace!("Event {:#x} set, woke {} waiter(s), signaled={}", self.id, woken, self.signaled);
    }

    /// Clears the persistent signaled flag.
    pub(crate) fn reset(&mut self) {
        self.signaled = false;
    }

    /// Observes the signaled flag for a new waiter, consuming it if the event
    /// is auto-reset.
    pub(crate) fn take_signaled(&mut self) -> bool {
        let signaled = self.signaled;
        if signaled && self.auto_reset {
            self.signaled = false;
        }
        signaled
    }

    pub(crate) fn restore_state(&mut self, signaled: bool, payload: EventPayload) {
        self.signaled = signaled;
        self.payload = payload;
    }

    pub(crate) fn set_payload(&mut self, payload: EventPayload) {
        self.payload = payload;
    }

    pub(crate) fn add_waiter(&mut self, waiter: &Arc<Waiter>) {
        self.waiters.push(Arc::downgrade(waiter));
    }

    pub(crate) fn remove_waiter(&mut self, waiter: &Arc<Waiter>) {
        let target = Arc::as_ptr(waiter);
        self.waiters
            .retain(|weak| weak.strong_count() > 0 && !core::ptr::eq(weak.as_ptr(), target));
    }

    /// Detaches and wakes every waiter. Called when the event is destroyed.
    pub(crate) fn sever_waiters(&mut self) {
        for waiter in self.waiters.drain(..).filter_map(|weak| weak.upgrade()) {
            waiter.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct CountingWaker(AtomicUsize);

    impl ThreadWaker for CountingWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn waiter_on(event: &Event, waker: &Arc<CountingWaker>) -> Arc<Waiter> {
        Arc::new(Waiter::new(event.id(), event.serial(), false, waker.clone()))
    }

    #[test]
    fn test_event_kind_codes() {
        for raw in 0..9 {
            assert_eq!(EventKind::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(EventKind::from_raw(9), None);
        assert!(EventKind::Debug.uses_signal_slot());
        assert!(!EventKind::Debug.is_cpu_signalable());
        assert!(!EventKind::Memory.uses_signal_slot());
    }

    #[test]
    fn test_manual_reset_set_with_waiters() {
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut event = Event::new(1, 0, EventKind::Signal, false);
        let waiter = waiter_on(&event, &waker);
        event.add_waiter(&waiter);

        event.set();
        assert!(event.is_signaled());
        assert!(waiter.is_activated());
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_auto_reset_set_consumed_by_waiter() {
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut event = Event::new(1, 0, EventKind::Signal, true);
        let waiter = waiter_on(&event, &waker);
        event.add_waiter(&waiter);

        event.set();
        assert!(!event.is_signaled());
        assert!(waiter.is_activated());
    }

    #[test]
    fn test_auto_reset_set_without_waiters() {
        let mut event = Event::new(1, 0, EventKind::Signal, true);
        event.set();
        assert!(event.is_signaled());

        // First observer consumes it
        assert!(event.take_signaled());
        assert!(!event.take_signaled());
    }

    #[test]
    fn test_dropped_waiter_does_not_consume() {
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut event = Event::new(1, 0, EventKind::Signal, true);
        let waiter = waiter_on(&event, &waker);
        event.add_waiter(&waiter);
        drop(waiter);

        event.set();
        assert!(event.is_signaled());
        assert_eq!(event.waiter_count(), 0);
    }

    #[test]
    fn test_sever_waiters() {
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut event = Event::new(7, 0, EventKind::Signal, false);
        let w1 = waiter_on(&event, &waker);
        let w2 = waiter_on(&event, &waker);
        event.add_waiter(&w1);
        event.add_waiter(&w2);

        event.remove_waiter(&w2);
        assert_eq!(event.waiter_count(), 1);

        event.sever_waiters();
        assert!(w1.is_detached());
        assert!(!w2.is_detached());
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);
    }
}
