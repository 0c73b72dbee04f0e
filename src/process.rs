//! Process-level event surface and device callbacks.
//!
//! [`EventProcess`] is the part of a process the event engine needs: its
//! event table and the devices it has opened. [`ProcessRegistry`] owns all
//! processes and receives notifications from the device layer.
//!
//! # Deferred delivery
//!
//! ```text
//! device interrupt ──► on_*() ──► DeferredQueue   (no table lock, no allocation)
//!                                       │
//! worker ──► run_deferred() ────────────┘
//!               ├─► InterruptDispatcher   (signal interrupts)
//!               └─► ExceptionBroadcaster  (faults, resets, poison)
//! ```

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use spin::RwLock;

use crate::config::{EventConfig, EVENTS_MMAP_TOKEN};
use crate::event::{EventKind, ResetCause};
use crate::exception::{ExceptionBroadcaster, FaultInfo};
use crate::interrupt::InterruptDispatcher;
use crate::page::SignalMemory;
use crate::queue::{DeferredQueue, DeferredWork};
use crate::snapshot::SnapshotCodec;
use crate::table::EventTable;
use crate::wait::{WaitCombinator, WaitContext, WaitRequest, WaitResult, WaitTimeout};

/// Process address-space id, as carried by device interrupts.
pub type ProcessId = u32;

/// Device-layer id of a GPU.
pub type DeviceId = u32;

/// Signals the engine may deliver to a process's lead thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalSignal {
    /// Unrecoverable GPU memory fault.
    SegmentationFault,
    /// Poisoned memory was consumed.
    BusError,
    /// Unhandled device exception.
    Terminate,
}

/// OS layer collaborator delivering signals to processes.
pub trait ProcessSignaler: Send + Sync {
    /// Sends `signal` to the lead thread of `pid`.
    fn send_signal(&self, pid: ProcessId, signal: FatalSignal);
}

/// Result of creating an event, as reported back to userspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedEvent {
    pub event_id: u32,
    /// Value the device must be given to signal this event.
    pub trigger_data: u32,
    /// [`EVENTS_MMAP_TOKEN`] for slot events, 0 otherwise.
    pub mmap_token: u64,
    /// Signal slot of the event, 0 for events without one.
    pub slot_index: u32,
}

/// Event state of one process.
pub struct EventProcess {
    pid: ProcessId,
    table: EventTable,
    /// Attached devices and the gpu id userspace knows each by.
    devices: RwLock<BTreeMap<DeviceId, u32>>,
}

impl EventProcess {
    /// Creates a process with an empty event table.
    pub fn new(pid: ProcessId, config: EventConfig) -> Self {
        Self {
            pid,
            table: EventTable::new(config),
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    #[inline]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The process's event table.
    #[inline]
    pub fn table(&self) -> &EventTable {
        &self.table
    }

    /// Records that the process uses `device`, known to userspace as `user_gpu_id`.
    pub fn attach_device(&self, device: DeviceId, user_gpu_id: u32) {
        debug!("Process {} attached device {} as gpu {:#x}", self.pid, device, user_gpu_id);
        self.devices.write().insert(device, user_gpu_id);
    }

    /// Forgets `device`.
    pub fn detach_device(&self, device: DeviceId) {
        self.devices.write().remove(&device);
    }

    /// The gpu id userspace knows `device` by, if attached.
    pub fn user_gpu_id(&self, device: DeviceId) -> Option<u32> {
        self.devices.read().get(&device).copied()
    }

    /// Returns `true` if `device` is attached.
    pub fn uses_device(&self, device: DeviceId) -> bool {
        self.devices.read().contains_key(&device)
    }

    /// Creates an event.
    ///
    /// # Arguments
    ///
    /// * `kind` - The event kind.
    /// * `auto_reset` - Clear the signaled state when a wait observes it.
    /// * `device` - Device the event is created for, which must be attached.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `device` is not attached.
    /// - Any error of [`EventTable::create_event`].
    pub fn create_event(&self, kind: EventKind, auto_reset: bool, device: Option<DeviceId>) -> AxResult<CreatedEvent> {
        if let Some(device) = device {
            if !self.uses_device(device) {
                return ax_err!(InvalidInput, "Event created for unattached device");
            }
        }

        let event_id = self.table.create_event(kind, auto_reset, None)?;
        let (mmap_token, slot_index) = if kind.uses_signal_slot() {
            (EVENTS_MMAP_TOKEN, event_id)
        } else {
            (0, 0)
        };

        Ok(CreatedEvent {
            event_id,
            trigger_data: event_id,
            mmap_token,
            slot_index,
        })
    }

    /// Destroys an event. See [`EventTable::destroy_event`].
    pub fn destroy_event(&self, event_id: u32) -> AxResult {
        self.table.destroy_event(event_id)
    }

    /// Signals an event from the CPU. See [`EventTable::set_event`].
    pub fn set_event(&self, event_id: u32) -> AxResult {
        self.table.set_event(event_id)
    }

    /// Clears an event. See [`EventTable::reset_event`].
    pub fn reset_event(&self, event_id: u32) -> AxResult {
        self.table.reset_event(event_id)
    }

    /// Waits on events with a raw millisecond timeout, where `0` means
    /// "do not block" and `u32::MAX` means "block forever".
    pub fn wait_on_events(
        &self,
        requests: &mut [WaitRequest],
        combinator: WaitCombinator,
        timeout_ms: u32,
        ctx: &dyn WaitContext,
    ) -> WaitResult {
        self.table
            .wait_on_events(requests, combinator, WaitTimeout::from_millis(timeout_ms), ctx)
    }

    /// Binds the user-allocated signal page behind `user_handle`.
    pub fn set_event_page(&self, user_handle: u64, memory: &dyn SignalMemory) -> AxResult {
        self.table.set_event_page(user_handle, memory)
    }

    /// Exposes the signal page to userspace.
    pub fn mmap_signal_page(&self, requested_len: usize) -> AxResult {
        self.table.mmap_signal_page(requested_len)
    }

    /// Serialises every event at `*offset`. See [`SnapshotCodec::checkpoint`].
    pub fn checkpoint(&self, buf: &mut [u8], offset: &mut usize) -> AxResult<usize> {
        SnapshotCodec::checkpoint(&self.table, buf, offset)
    }

    /// Recreates one event from `*offset`. See [`SnapshotCodec::restore`].
    pub fn restore(&self, buf: &[u8], offset: &mut usize, memory: &dyn SignalMemory) -> AxResult {
        SnapshotCodec::restore(&self.table, buf, offset, memory)
    }
}

/// All processes known to the event engine.
pub struct ProcessRegistry {
    config: EventConfig,
    processes: RwLock<BTreeMap<ProcessId, Arc<EventProcess>>>,
    signaler: Arc<dyn ProcessSignaler>,
    deferred: DeferredQueue,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    pub fn new(config: EventConfig, signaler: Arc<dyn ProcessSignaler>) -> Self {
        Self {
            config,
            processes: RwLock::new(BTreeMap::new()),
            signaler,
            deferred: DeferredQueue::new(),
        }
    }

    /// Creates the event state of a new process.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if `pid` is registered.
    pub fn create_process(&self, pid: ProcessId) -> AxResult<Arc<EventProcess>> {
        let mut processes = self.processes.write();
        if processes.contains_key(&pid) {
            return ax_err!(AlreadyExists, "Process already registered");
        }
        let process = Arc::new(EventProcess::new(pid, self.config));
        processes.insert(pid, Arc::clone(&process));
        debug!("Created event process {}", pid);
        Ok(process)
    }

    /// Tears down a process: every event is destroyed, waking its waiters,
    /// and the signal page is released.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `pid` is not registered.
    pub fn destroy_process(&self, pid: ProcessId) -> AxResult {
        let Some(process) = self.processes.write().remove(&pid) else {
            return ax_err!(NotFound, "Process not registered");
        };
        process.table().clear();
        debug!("Destroyed event process {}", pid);
        Ok(())
    }

    /// Finds a process by id.
    pub fn lookup(&self, pid: ProcessId) -> Option<Arc<EventProcess>> {
        self.processes.read().get(&pid).cloned()
    }

    /// Number of registered processes.
    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    /// Processes attached to `device`.
    pub fn processes_on_device(&self, device: DeviceId) -> Vec<Arc<EventProcess>> {
        self.processes
            .read()
            .values()
            .filter(|process| process.uses_device(device))
            .cloned()
            .collect()
    }

    /// Signal interrupt from the device. Safe to call from interrupt context.
    pub fn on_interrupt(&self, pid: ProcessId, partial_id: u32, valid_id_bits: u32) -> bool {
        self.deferred.push(DeferredWork::Interrupt {
            pid,
            partial_id,
            valid_id_bits,
        })
    }

    /// Fatal memory exception. Safe to call from interrupt context.
    pub fn on_memory_exception(&self, device: DeviceId, pid: ProcessId, fault: FaultInfo) -> bool {
        self.deferred.push(DeferredWork::MemoryException { device, pid, fault })
    }

    /// Recoverable VM fault. Safe to call from interrupt context.
    pub fn on_vm_fault(&self, device: DeviceId, pid: ProcessId, fault: FaultInfo) -> bool {
        self.deferred.push(DeferredWork::VmFault { device, pid, fault })
    }

    /// Hardware exception. Safe to call from interrupt context.
    pub fn on_hw_exception(&self, pid: ProcessId) -> bool {
        self.deferred.push(DeferredWork::HwException { pid })
    }

    /// Device reset. Safe to call from interrupt context.
    pub fn on_device_reset(&self, device: DeviceId, cause: ResetCause) -> bool {
        self.deferred.push(DeferredWork::DeviceReset { device, cause })
    }

    /// Poison consumption. Safe to call from interrupt context.
    pub fn on_poison_consumed(&self, device: DeviceId, pid: ProcessId) -> bool {
        self.deferred.push(DeferredWork::PoisonConsumed { device, pid })
    }

    /// Number of notifications waiting for [`run_deferred`](Self::run_deferred).
    pub fn pending_work(&self) -> usize {
        self.deferred.len()
    }

    /// Notifications dropped because the deferred queue was full.
    pub fn dropped_work(&self) -> u64 {
        self.deferred.dropped()
    }

    /// Processes queued notifications. Must run in a context that may block
    /// on table locks. Returns the number of records processed.
    pub fn run_deferred(&self) -> usize {
        let work = self.deferred.drain();
        for item in work.iter() {
            self.dispatch(item);
        }
        work.len()
    }

    fn dispatch(&self, work: &DeferredWork) {
        let broadcaster = ExceptionBroadcaster::new(self.signaler.as_ref(), self.config);

        match *work {
            DeferredWork::Interrupt {
                pid,
                partial_id,
                valid_id_bits,
            } => {
                if let Some(process) = self.process_for(pid) {
                    InterruptDispatcher::new(process.table()).signal(partial_id, valid_id_bits);
                }
            }
            DeferredWork::MemoryException { device, pid, fault } => {
                if let Some(process) = self.process_for(pid) {
                    broadcaster.signal_memory_exception(&process, device, &fault);
                }
            }
            DeferredWork::VmFault { device, pid, fault } => {
                if let Some(process) = self.process_for(pid) {
                    broadcaster.signal_vm_fault(&process, device, &fault);
                }
            }
            DeferredWork::HwException { pid } => {
                if let Some(process) = self.process_for(pid) {
                    broadcaster.signal_hw_exception(&process);
                }
            }
            DeferredWork::DeviceReset { device, cause } => {
                let processes = self.processes_on_device(device);
                broadcaster.signal_reset(processes.iter().map(|process| &**process), device, cause);
            }
            DeferredWork::PoisonConsumed { device, pid } => {
                if let Some(process) = self.process_for(pid) {
                    broadcaster.signal_poison_consumed(&process, device);
                }
            }
        }
    }

    fn process_for(&self, pid: ProcessId) -> Option<Arc<EventProcess>> {
        let process = self.lookup(pid);
        if process.is_none() {
            debug!("Dropping notification for unknown process {}", pid);
        }
        process
    }
}
