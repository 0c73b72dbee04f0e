//! Checkpoint and restore of an event table.
//!
//! Every event is written as one fixed-size little-endian record:
//!
//! | Offset | Size | Field                                        |
//! |--------|------|----------------------------------------------|
//! | 0      | 4    | tag, `"EVT1"`                                |
//! | 4      | 4    | reserved, zero                               |
//! | 8      | 8    | signal page handle, first record only, else 0 |
//! | 16     | 4    | event id                                     |
//! | 20     | 4    | auto reset                                   |
//! | 24     | 4    | kind                                         |
//! | 28     | 4    | signaled                                     |
//! | 32     | 4    | payload tag: 0 none, 1 memory, 2 hw exception |
//! | 36     | 28   | payload                                      |
//! | 64     | 8    | padding                                      |
//!
//! Restore consumes one record per call so that the caller can interleave
//! records of other object types in the same stream.

use axerrno::{ax_err, AxResult};

use crate::event::{
    EventKind, EventPayload, HwExceptionData, MemoryErrorType, MemoryExceptionData, MemoryFailure,
    ResetCause,
};
use crate::page::SignalMemory;
use crate::table::EventTable;

/// Size of one serialised event.
pub const RECORD_SIZE: usize = 72;

const RECORD_TAG: u32 = u32::from_le_bytes(*b"EVT1");

const PAYLOAD_NONE: u32 = 0;
const PAYLOAD_MEMORY: u32 = 1;
const PAYLOAD_HW_EXCEPTION: u32 = 2;

const FAILURE_NOT_PRESENT: u32 = 1 << 0;
const FAILURE_READ_ONLY: u32 = 1 << 1;
const FAILURE_NO_EXECUTE: u32 = 1 << 2;
const FAILURE_IMPRECISE: u32 = 1 << 3;

const PAYLOAD_OFFSET: usize = 36;

fn put_u32(record: &mut [u8], at: usize, value: u32) {
    record[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(record: &mut [u8], at: usize, value: u64) {
    record[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(record: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&record[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(record: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&record[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Decoded form of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventRecord {
    user_handle: u64,
    id: u32,
    auto_reset: bool,
    kind: EventKind,
    signaled: bool,
    payload: EventPayload,
}

impl EventRecord {
    fn encode(&self, record: &mut [u8]) {
        record[..RECORD_SIZE].fill(0);
        put_u32(record, 0, RECORD_TAG);
        put_u64(record, 8, self.user_handle);
        put_u32(record, 16, self.id);
        put_u32(record, 20, self.auto_reset as u32);
        put_u32(record, 24, self.kind.as_raw());
        put_u32(record, 28, self.signaled as u32);

        let p = PAYLOAD_OFFSET;
        match self.payload {
            EventPayload::None => put_u32(record, 32, PAYLOAD_NONE),
            EventPayload::Memory(data) => {
                put_u32(record, 32, PAYLOAD_MEMORY);
                put_u32(record, p, data.gpu_id);
                put_u64(record, p + 4, data.va);
                put_u32(record, p + 12, encode_failure(&data.failure));
                put_u32(record, p + 16, data.error_type as u32);
            }
            EventPayload::HwException(data) => {
                put_u32(record, 32, PAYLOAD_HW_EXCEPTION);
                put_u32(record, p, data.reset_type);
                put_u32(record, p + 4, data.reset_cause as u32);
                put_u32(record, p + 8, data.memory_lost as u32);
                put_u32(record, p + 12, data.gpu_id);
            }
        }
    }

    fn decode(record: &[u8]) -> AxResult<Self> {
        if get_u32(record, 0) != RECORD_TAG {
            return ax_err!(InvalidInput, "Bad event record tag");
        }
        let Some(kind) = EventKind::from_raw(get_u32(record, 24)) else {
            return ax_err!(InvalidInput, "Bad event kind in record");
        };

        let p = PAYLOAD_OFFSET;
        let payload = match get_u32(record, 32) {
            PAYLOAD_NONE => EventPayload::None,
            PAYLOAD_MEMORY => {
                let Some(error_type) = MemoryErrorType::from_raw(get_u32(record, p + 16)) else {
                    return ax_err!(InvalidInput, "Bad memory error type in record");
                };
                EventPayload::Memory(MemoryExceptionData {
                    gpu_id: get_u32(record, p),
                    va: get_u64(record, p + 4),
                    failure: decode_failure(get_u32(record, p + 12)),
                    error_type,
                })
            }
            PAYLOAD_HW_EXCEPTION => {
                let Some(reset_cause) = ResetCause::from_raw(get_u32(record, p + 4)) else {
                    return ax_err!(InvalidInput, "Bad reset cause in record");
                };
                EventPayload::HwException(HwExceptionData {
                    reset_type: get_u32(record, p),
                    reset_cause,
                    memory_lost: get_u32(record, p + 8) != 0,
                    gpu_id: get_u32(record, p + 12),
                })
            }
            _ => return ax_err!(InvalidInput, "Bad payload tag in record"),
        };

        Ok(Self {
            user_handle: get_u64(record, 8),
            id: get_u32(record, 16),
            auto_reset: get_u32(record, 20) != 0,
            kind,
            signaled: get_u32(record, 28) != 0,
            payload,
        })
    }
}

fn encode_failure(failure: &MemoryFailure) -> u32 {
    let mut bits = 0;
    if failure.not_present {
        bits |= FAILURE_NOT_PRESENT;
    }
    if failure.read_only {
        bits |= FAILURE_READ_ONLY;
    }
    if failure.no_execute {
        bits |= FAILURE_NO_EXECUTE;
    }
    if failure.imprecise {
        bits |= FAILURE_IMPRECISE;
    }
    bits
}

fn decode_failure(bits: u32) -> MemoryFailure {
    MemoryFailure {
        not_present: bits & FAILURE_NOT_PRESENT != 0,
        read_only: bits & FAILURE_READ_ONLY != 0,
        no_execute: bits & FAILURE_NO_EXECUTE != 0,
        imprecise: bits & FAILURE_IMPRECISE != 0,
    }
}

/// Serialises event tables for process checkpoint and restore.
pub struct SnapshotCodec;

impl SnapshotCodec {
    /// Bytes [`checkpoint`](Self::checkpoint) needs for `table`.
    pub fn checkpoint_size(table: &EventTable) -> usize {
        table.count() as usize * RECORD_SIZE
    }

    /// Writes one record per event at `buf[*offset..]` and advances `offset`.
    ///
    /// The table is locked for the whole walk, so the records form a
    /// consistent image. The handle of an externally bound signal page is
    /// carried by the first record.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `BadAddress` if the buffer cannot hold every record.
    pub fn checkpoint(table: &EventTable, buf: &mut [u8], offset: &mut usize) -> AxResult<usize> {
        let inner = table.lock();
        let needed = inner.count() * RECORD_SIZE;
        let Some(out) = buf.get_mut(*offset..).filter(|out| out.len() >= needed) else {
            return ax_err!(BadAddress, "Checkpoint buffer too small");
        };

        let handle = inner
            .signal_page
            .as_ref()
            .and_then(|page| page.user_handle())
            .unwrap_or(0);

        for (index, (event, record)) in inner.events().zip(out.chunks_exact_mut(RECORD_SIZE)).enumerate() {
            EventRecord {
                user_handle: if index == 0 { handle } else { 0 },
                id: event.id(),
                auto_reset: event.auto_reset(),
                kind: event.kind(),
                signaled: event.is_signaled(),
                payload: *event.payload(),
            }
            .encode(record);
        }

        *offset += needed;
        debug!("Checkpointed {} event(s)", inner.count());
        Ok(needed)
    }

    /// Recreates the event described by the record at `buf[*offset..]` and
    /// advances `offset` past it.
    ///
    /// A record carrying a page handle binds that page through `memory` if
    /// the table has none yet. The event gets its original id, signaled
    /// state and payload.
    ///
    /// # Errors
    ///
    /// - `BadAddress` if fewer than [`RECORD_SIZE`] bytes remain.
    /// - `InvalidInput` if the record is malformed or its id is taken.
    /// - Any error of binding the page or creating the event.
    pub fn restore(table: &EventTable, buf: &[u8], offset: &mut usize, memory: &dyn SignalMemory) -> AxResult {
        let Some(bytes) = buf.get(*offset..).and_then(|rest| rest.get(..RECORD_SIZE)) else {
            return ax_err!(BadAddress, "Truncated event record");
        };
        let record = EventRecord::decode(bytes)?;

        if record.user_handle != 0 && table.signal_page_buffer().is_none() {
            table.set_event_page(record.user_handle, memory)?;
        }

        let mut inner = table.lock();
        let id = inner.create_event(record.kind, record.auto_reset, Some(record.id))?;
        if let Some(event) = inner.event_mut(id) {
            event.restore_state(record.signaled, record.payload);
        }
        drop(inner);

        *offset += RECORD_SIZE;
        trace!("Restored event {:#x} kind {:?}", id, record.kind);
        Ok(())
    }
}
