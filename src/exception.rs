//! Device exception broadcast.
//!
//! Exceptions are delivered by type: every non-signal event of the matching
//! kind gets a copy of the exception payload and is set. Some exceptions are
//! fatal to the process regardless of listeners, and an exception nobody
//! listens for can be escalated to a terminate signal.

use crate::config::EventConfig;
use crate::event::{
    EventKind, EventPayload, HwExceptionData, MemoryErrorType, MemoryExceptionData, MemoryFailure,
    ResetCause, RESET_TYPE_WHOLE_GPU,
};
use crate::process::{DeviceId, EventProcess, FatalSignal, ProcessSignaler};
use crate::table::TableInner;

/// A memory fault as reported by the device layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultInfo {
    /// Faulting virtual address.
    pub address: u64,
    /// Fault classification.
    pub failure: MemoryFailure,
}

/// Sets every non-signal event for which `payload_for` returns a payload.
fn stamp_and_set(inner: &mut TableInner, mut payload_for: impl FnMut(EventKind) -> Option<EventPayload>) -> usize {
    let mut signaled = 0;
    for event in inner.other_events.values_mut() {
        if let Some(payload) = payload_for(event.kind()) {
            if payload != EventPayload::None {
                event.set_payload(payload);
            }
            event.set();
            signaled += 1;
        }
    }
    signaled
}

/// Fans device exceptions out to the events of a process.
pub struct ExceptionBroadcaster<'a> {
    signaler: &'a dyn ProcessSignaler,
    config: EventConfig,
}

impl<'a> ExceptionBroadcaster<'a> {
    /// Creates a broadcaster delivering fatal signals through `signaler`.
    pub fn new(signaler: &'a dyn ProcessSignaler, config: EventConfig) -> Self {
        Self { signaler, config }
    }

    /// Sets every non-signal event of `kind`, attaching `payload`.
    ///
    /// A memory exception is fatal: the process is always sent
    /// [`FatalSignal::SegmentationFault`]. If no event matched, the process is
    /// terminated when [`EventConfig::sigterm_on_unhandled_exception`] is set,
    /// otherwise the exception is only logged.
    ///
    /// Returns the number of events signaled.
    pub fn signal_by_type(&self, process: &EventProcess, kind: EventKind, payload: EventPayload) -> usize {
        let found = stamp_and_set(&mut process.table().lock(), |event_kind| {
            (event_kind == kind).then_some(payload)
        });
        let pid = process.pid();

        if kind == EventKind::Memory {
            warn!("Sending SIGSEGV to process {}", pid);
            self.signaler.send_signal(pid, FatalSignal::SegmentationFault);
        }

        if found == 0 {
            if self.config.sigterm_on_unhandled_exception {
                warn!("Sending SIGTERM to process {}: no {:?} event", pid, kind);
                self.signaler.send_signal(pid, FatalSignal::Terminate);
            } else {
                error!("Process {} got unhandled {:?} exception", pid, kind);
            }
        } else {
            debug!("Signaled {} {:?} event(s) of process {}", found, kind, pid);
        }
        found
    }

    /// Reports a fatal memory exception on `device`.
    pub fn signal_memory_exception(&self, process: &EventProcess, device: DeviceId, fault: &FaultInfo) -> usize {
        let Some(gpu_id) = process.user_gpu_id(device) else {
            warn!("Memory exception from device {} not attached to process {}", device, process.pid());
            return 0;
        };
        let data = MemoryExceptionData {
            gpu_id,
            va: fault.address,
            failure: fault.failure,
            error_type: MemoryErrorType::None,
        };
        self.signal_by_type(process, EventKind::Memory, EventPayload::Memory(data))
    }

    /// Reports a recoverable VM fault to memory event listeners only.
    pub fn signal_vm_fault(&self, process: &EventProcess, device: DeviceId, fault: &FaultInfo) -> usize {
        let Some(gpu_id) = process.user_gpu_id(device) else {
            warn!("VM fault from device {} not attached to process {}", device, process.pid());
            return 0;
        };
        let data = MemoryExceptionData {
            gpu_id,
            va: fault.address,
            failure: fault.failure,
            error_type: MemoryErrorType::None,
        };
        stamp_and_set(&mut process.table().lock(), |kind| {
            (kind == EventKind::Memory).then_some(EventPayload::Memory(data))
        })
    }

    /// Reports a hardware exception on the process.
    pub fn signal_hw_exception(&self, process: &EventProcess) -> usize {
        self.signal_by_type(process, EventKind::HwException, EventPayload::None)
    }

    /// Reports a reset of `device` to every process in `processes` attached
    /// to it.
    ///
    /// Hardware exception events always fire; memory events fire too when
    /// the reset was caused by an ECC error.
    pub fn signal_reset<'p>(
        &self,
        processes: impl IntoIterator<Item = &'p EventProcess>,
        device: DeviceId,
        cause: ResetCause,
    ) -> usize {
        let mut signaled = 0;
        for process in processes {
            let Some(gpu_id) = process.user_gpu_id(device) else {
                continue;
            };
            let hw = HwExceptionData {
                reset_type: RESET_TYPE_WHOLE_GPU,
                reset_cause: cause,
                memory_lost: true,
                gpu_id,
            };
            let memory = MemoryExceptionData {
                gpu_id,
                error_type: MemoryErrorType::SramEcc,
                ..Default::default()
            };

            signaled += stamp_and_set(&mut process.table().lock(), |kind| match kind {
                EventKind::HwException => Some(EventPayload::HwException(hw)),
                EventKind::Memory if cause == ResetCause::Ecc => Some(EventPayload::Memory(memory)),
                _ => None,
            });
        }

        debug!("Reset of device {} ({:?}) signaled {} event(s)", device, cause, signaled);
        signaled
    }

    /// Reports that `process` consumed poisoned memory on `device`.
    ///
    /// Hardware exception and memory events fire, then the process is sent
    /// [`FatalSignal::BusError`].
    pub fn signal_poison_consumed(&self, process: &EventProcess, device: DeviceId) -> usize {
        let Some(gpu_id) = process.user_gpu_id(device) else {
            warn!("Poison from device {} not attached to process {}", device, process.pid());
            return 0;
        };
        let hw = HwExceptionData {
            reset_type: RESET_TYPE_WHOLE_GPU,
            reset_cause: ResetCause::Ecc,
            memory_lost: true,
            gpu_id,
        };
        let memory = MemoryExceptionData {
            gpu_id,
            error_type: MemoryErrorType::PoisonConsumed,
            ..Default::default()
        };

        let signaled = stamp_and_set(&mut process.table().lock(), |kind| match kind {
            EventKind::HwException => Some(EventPayload::HwException(hw)),
            EventKind::Memory => Some(EventPayload::Memory(memory)),
            _ => None,
        });

        // The runtime handles SIGBUS.
        warn!("Sending SIGBUS to process {}", process.pid());
        self.signaler.send_signal(process.pid(), FatalSignal::BusError);
        signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessId;
    use alloc::vec::Vec;
    use spin::Mutex;

    #[derive(Default)]
    struct RecordingSignaler {
        sent: Mutex<Vec<(ProcessId, FatalSignal)>>,
    }

    impl ProcessSignaler for RecordingSignaler {
        fn send_signal(&self, pid: ProcessId, signal: FatalSignal) {
            self.sent.lock().push((pid, signal));
        }
    }

    fn process_on_device(pid: ProcessId) -> EventProcess {
        let process = EventProcess::new(pid, EventConfig::default());
        process.attach_device(3, 0x1234);
        process
    }

    #[test]
    fn test_memory_exception_is_fatal() {
        let signaler = RecordingSignaler::default();
        let broadcaster = ExceptionBroadcaster::new(&signaler, EventConfig::default());
        let process = process_on_device(10);
        let id = process.table().create_event(EventKind::Memory, false, None).unwrap();

        let fault = FaultInfo {
            address: 0xdead_0000,
            failure: MemoryFailure { not_present: true, ..Default::default() },
        };
        assert_eq!(broadcaster.signal_memory_exception(&process, 3, &fault), 1);

        let info = process.table().lookup(id).unwrap();
        assert!(info.signaled);
        match info.payload {
            EventPayload::Memory(data) => {
                assert_eq!(data.gpu_id, 0x1234);
                assert_eq!(data.va, 0xdead_0000);
                assert!(data.failure.not_present);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(*signaler.sent.lock(), alloc::vec![(10, FatalSignal::SegmentationFault)]);
    }

    #[test]
    fn test_unhandled_exception_policy() {
        let signaler = RecordingSignaler::default();
        let process = process_on_device(11);

        // Default policy only logs
        let broadcaster = ExceptionBroadcaster::new(&signaler, EventConfig::default());
        assert_eq!(broadcaster.signal_hw_exception(&process), 0);
        assert!(signaler.sent.lock().is_empty());

        let config = EventConfig::default().with_sigterm_on_unhandled_exception(true);
        let broadcaster = ExceptionBroadcaster::new(&signaler, config);
        assert_eq!(broadcaster.signal_hw_exception(&process), 0);
        assert_eq!(*signaler.sent.lock(), alloc::vec![(11, FatalSignal::Terminate)]);
    }

    #[test]
    fn test_vm_fault_not_fatal() {
        let signaler = RecordingSignaler::default();
        let broadcaster = ExceptionBroadcaster::new(&signaler, EventConfig::default());
        let process = process_on_device(12);
        process.table().create_event(EventKind::Memory, false, None).unwrap();

        assert_eq!(broadcaster.signal_vm_fault(&process, 3, &FaultInfo::default()), 1);
        assert_eq!(broadcaster.signal_vm_fault(&process, 4, &FaultInfo::default()), 0);
        assert!(signaler.sent.lock().is_empty());
    }

    #[test]
    fn test_reset_ecc_reaches_memory_events() {
        let signaler = RecordingSignaler::default();
        let broadcaster = ExceptionBroadcaster::new(&signaler, EventConfig::default());
        let attached = process_on_device(13);
        let detached = EventProcess::new(14, EventConfig::default());
        let hw = attached.table().create_event(EventKind::HwException, false, None).unwrap();
        let mem = attached.table().create_event(EventKind::Memory, false, None).unwrap();
        detached.table().create_event(EventKind::HwException, false, None).unwrap();

        // Hang: only the hardware exception event
        assert_eq!(broadcaster.signal_reset([&attached, &detached], 3, ResetCause::GpuHang), 1);
        assert!(!attached.table().lookup(mem).unwrap().signaled);

        // ECC: both
        attached.table().lock().event_mut(hw).unwrap().reset();
        assert_eq!(broadcaster.signal_reset([&attached, &detached], 3, ResetCause::Ecc), 2);
        match attached.table().lookup(hw).unwrap().payload {
            EventPayload::HwException(data) => {
                assert_eq!(data.reset_cause, ResetCause::Ecc);
                assert!(data.memory_lost);
                assert_eq!(data.gpu_id, 0x1234);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(signaler.sent.lock().is_empty());
    }

    #[test]
    fn test_poison_consumed() {
        let signaler = RecordingSignaler::default();
        let broadcaster = ExceptionBroadcaster::new(&signaler, EventConfig::default());
        let process = process_on_device(15);
        let mem = process.table().create_event(EventKind::Memory, false, None).unwrap();
        process.table().create_event(EventKind::HwException, false, None).unwrap();
        process.table().create_event(EventKind::Queue, false, None).unwrap();

        assert_eq!(broadcaster.signal_poison_consumed(&process, 3), 2);
        match process.table().lookup(mem).unwrap().payload {
            EventPayload::Memory(data) => assert_eq!(data.error_type, MemoryErrorType::PoisonConsumed),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(*signaler.sent.lock(), alloc::vec![(15, FatalSignal::BusError)]);
    }
}
