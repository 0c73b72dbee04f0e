//! Deferred work queue for interrupt-origin notifications.
//!
//! Interrupt handlers must not block on an event table lock. They push a
//! [`DeferredWork`] record here instead; a schedulable worker later drains
//! the queue and performs the actual signaling under the table lock.
//!
//! The queue is a fixed-capacity array so that pushing never allocates. When
//! it is full the record is dropped and counted, like an overflowing
//! interrupt ring.

use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::event::ResetCause;
use crate::exception::FaultInfo;
use crate::process::{DeviceId, ProcessId};

/// Maximum number of records waiting for the worker.
pub const DEFERRED_QUEUE_DEPTH: usize = 128;

/// A device notification waiting to be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredWork {
    /// A signal interrupt carrying a possibly truncated event id.
    Interrupt {
        pid: ProcessId,
        partial_id: u32,
        valid_id_bits: u32,
    },
    /// A fatal memory exception.
    MemoryException {
        device: DeviceId,
        pid: ProcessId,
        fault: FaultInfo,
    },
    /// A recoverable VM fault reported to memory event listeners.
    VmFault {
        device: DeviceId,
        pid: ProcessId,
        fault: FaultInfo,
    },
    /// A hardware exception raised for one process.
    HwException { pid: ProcessId },
    /// A device reset affecting every attached process.
    DeviceReset { device: DeviceId, cause: ResetCause },
    /// Poisoned memory was consumed by a process.
    PoisonConsumed { device: DeviceId, pid: ProcessId },
}

/// Bounded, non-allocating queue of [`DeferredWork`].
pub struct DeferredQueue {
    pending: Mutex<ArrayVec<DeferredWork, DEFERRED_QUEUE_DEPTH>>,
    /// Records dropped because the queue was full.
    dropped: AtomicU64,
}

impl DeferredQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(ArrayVec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues a record. Returns `false` if the queue was full and the record
    /// was dropped.
    pub fn push(&self, work: DeferredWork) -> bool {
        match self.pending.lock().try_push(work) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Deferred event queue full, dropping {:?}", work);
                false
            }
        }
    }

    /// Takes every queued record, oldest first.
    pub fn drain(&self) -> ArrayVec<DeferredWork, DEFERRED_QUEUE_DEPTH> {
        core::mem::take(&mut *self.pending.lock())
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Number of records dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}
