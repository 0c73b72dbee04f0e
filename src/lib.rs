#![no_std]

//! # GPU Compute Events
//!
//! This crate implements the event notification engine of a GPU compute
//! driver: per-process event tables, a signal page shared with the device and
//! userspace, blocking multi-event waits, device interrupt dispatch, device
//! exception broadcast, and checkpoint/restore of event state.
//! It is designed for `no_std` environments and uses the `alloc` crate for dynamic memory allocation.
//!
//! ## Architecture
//!
//! ### Core Infrastructure
//! - [`EventTable`]: Per-process id-keyed event registry, serialised by one lock
//! - [`SignalPage`]: Array of 64-bit slots shared with the device and userspace
//! - [`Event`]: Signal state machine with manual and auto reset
//! - [`EventConfig`]: Engine tunables
//!
//! ### Waiting
//! - [`EventTable::wait_on_events`]: Any/All waits with timeout and interruption
//! - [`WaitContext`] / [`ThreadWaker`]: Scheduler services the wait parks through
//! - `StdWaitContext`: `std::thread` backed context (feature `std`)
//!
//! ### Device Side
//! - [`InterruptDispatcher`]: Resolves full or truncated interrupt ids to events
//! - [`ExceptionBroadcaster`]: Memory, VM fault, reset and poison notifications
//! - [`DeferredQueue`]: Non-allocating hand-off out of interrupt context
//!
//! ### High-Level API
//! - [`ProcessRegistry`]: Processes by id, device callbacks, deferred worker
//! - [`EventProcess`]: The event surface of one process
//! - [`SnapshotCodec`]: Fixed-size checkpoint records
//!
//! ## Id Ranges
//!
//! | Kinds         | Ids                                   |
//! |---------------|---------------------------------------|
//! | Signal, Debug | slot index, below the mapped slots    |
//! | others        | `[signal_event_limit, 0x7fff_ffff]`   |
//!
//! ## Examples
//!
//! ### Creating and Waiting on Events
//!
//! ```rust,ignore
//! use gpu_events::{EventConfig, EventKind, ProcessRegistry, StdWaitContext, WaitCombinator, WaitRequest};
//!
//! let registry = ProcessRegistry::new(EventConfig::default(), signaler);
//! let process = registry.create_process(pid)?;
//!
//! let event = process.create_event(EventKind::Signal, true, None)?;
//! // Hand `event.trigger_data` to the device, map the page at `event.mmap_token`
//!
//! let ctx = StdWaitContext::current();
//! let mut requests = [WaitRequest::new(event.event_id)];
//! let result = process.wait_on_events(&mut requests, WaitCombinator::Any, 1000, &ctx);
//! ```
//!
//! ### Device Interrupts
//!
//! ```rust,ignore
//! // In the interrupt handler: never blocks, never allocates
//! registry.on_interrupt(pid, partial_id, valid_id_bits);
//!
//! // In the worker
//! loop {
//!     registry.run_deferred();
//!     // Sleep until the next interrupt...
//! }
//! ```

extern crate alloc;
#[macro_use]
extern crate log;

mod config;
mod event;
mod exception;
mod ids;
mod interrupt;
mod page;
mod process;
mod queue;
mod snapshot;
mod table;
mod wait;

pub use config::{
    EventConfig, DEFAULT_MAPPED_SLOTS, EVENTS_MMAP_TOKEN, LAST_NONSIGNAL_EVENT_ID, SIGNAL_EVENT_LIMIT,
    UNSIGNALED,
};
pub use event::{
    Event, EventInfo, EventKind, EventPayload, HwExceptionData, MemoryErrorType, MemoryExceptionData,
    MemoryFailure, ResetCause, RESET_TYPE_WHOLE_GPU,
};
pub use exception::{ExceptionBroadcaster, FaultInfo};
pub use interrupt::InterruptDispatcher;
pub use page::{SignalMemory, SignalPage, SlotBuffer};
pub use process::{CreatedEvent, DeviceId, EventProcess, FatalSignal, ProcessId, ProcessRegistry, ProcessSignaler};
pub use queue::{DeferredQueue, DeferredWork, DEFERRED_QUEUE_DEPTH};
pub use snapshot::{SnapshotCodec, RECORD_SIZE};
pub use table::{EventCursor, EventTable};
pub use wait::{
    Interruption, ThreadWaker, WaitCombinator, WaitContext, WaitRequest, WaitResult, WaitTimeout,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        mod std_context;
        pub use std_context::{Interrupter, StdWaitContext};
    }
}
