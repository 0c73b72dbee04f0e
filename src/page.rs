//! Shared signal page.
//!
//! The signal page is an array of 64-bit slots shared by three parties:
//!
//! - the **device**, which writes a slot when it signals an event,
//! - **userspace**, which maps the page read-only and polls it,
//! - the **engine**, the only party that resets a slot to [`UNSIGNALED`].
//!
//! Signal and debug events own the slot whose index equals their event id.
//! The page is either allocated by the engine or bound to a buffer the memory
//! layer already mapped (see [`SignalMemory`]).

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use axerrno::{ax_err, ax_err_type, AxResult};

use crate::config::UNSIGNALED;

/// Slot storage shared between the engine, the device and userspace.
pub type SlotBuffer = Arc<[AtomicU64]>;

/// Memory layer collaborator.
///
/// Resolves the opaque handle of a user-allocated buffer to the kernel
/// mapping of that buffer.
pub trait SignalMemory: Send + Sync {
    /// Returns the slot buffer behind `user_handle` and its mapped size in bytes.
    fn map_signal_buffer(&self, user_handle: u64) -> AxResult<(SlotBuffer, usize)>;
}

/// A signal page owned by one event table.
pub struct SignalPage {
    slots: SlotBuffer,
    /// Bytes of the page userspace has mapped.
    mapped_size: usize,
    /// Handle of the backing user buffer, if the page was bound externally.
    user_handle: Option<u64>,
}

impl SignalPage {
    /// Allocates a page of `capacity` slots, all unsignaled.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of slots.
    /// * `mapped_size` - Bytes userspace is assumed to have mapped.
    ///
    /// # Errors
    ///
    /// Returns `NoMemory` if the slot array cannot be reserved.
    pub fn allocate(capacity: usize, mapped_size: usize) -> AxResult<Self> {
        let mut slots = Vec::new();
        if slots.try_reserve_exact(capacity).is_err() {
            return ax_err!(NoMemory, "Failed to allocate signal page");
        }
        slots.extend((0..capacity).map(|_| AtomicU64::new(UNSIGNALED)));

        debug!("Allocated signal page: {} slots, {} bytes mapped", capacity, mapped_size);
        Ok(Self {
            slots: slots.into(),
            mapped_size: mapped_size.min(capacity * 8),
            user_handle: None,
        })
    }

    /// Wraps a buffer the memory layer already mapped.
    ///
    /// The slots are left as the owner of the buffer initialised them.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `size` is zero, not a multiple of the slot
    /// size, or larger than the buffer.
    pub fn bind_external(slots: SlotBuffer, size: usize, user_handle: u64) -> AxResult<Self> {
        if size == 0 || size % 8 != 0 || size > slots.len() * 8 {
            return ax_err!(InvalidInput, "Invalid signal page size");
        }

        debug!("Bound external signal page: handle {:#x}, {} bytes", user_handle, size);
        Ok(Self {
            slots,
            mapped_size: size,
            user_handle: Some(user_handle),
        })
    }

    /// Number of slots in the page.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bytes userspace has mapped.
    #[inline]
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Number of slots userspace can see.
    #[inline]
    pub fn mapped_slots(&self) -> usize {
        (self.mapped_size / 8).min(self.capacity())
    }

    /// Handle of the backing user buffer, if any.
    #[inline]
    pub fn user_handle(&self) -> Option<u64> {
        self.user_handle
    }

    /// Reads a slot. Out-of-range indices read as unsignaled.
    #[inline]
    pub fn slot(&self, index: usize) -> u64 {
        self.slots
            .get(index)
            .map_or(UNSIGNALED, |slot| slot.load(Ordering::Acquire))
    }

    /// Returns `true` if the slot holds anything but [`UNSIGNALED`].
    #[inline]
    pub fn is_signaled(&self, index: usize) -> bool {
        self.slot(index) != UNSIGNALED
    }

    /// Resets a slot to [`UNSIGNALED`].
    #[inline]
    pub fn acknowledge(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.store(UNSIGNALED, Ordering::Release);
        }
    }

    /// Writes `value` into a slot the way the device does when it signals.
    pub fn signal_from_device(&self, index: usize, value: u64) {
        if let Some(slot) = self.slots.get(index) {
            slot.store(value, Ordering::Release);
        }
    }

    /// Exposes the page to userspace.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `requested_len` exceeds the page.
    pub fn mmap(&mut self, requested_len: usize) -> AxResult {
        if requested_len > self.capacity() * 8 {
            return Err(ax_err_type!(InvalidInput, "Signal page mmap too large"));
        }
        self.mapped_size = requested_len;
        debug!("Signal page mapped: {} bytes", requested_len);
        Ok(())
    }

    /// Hands out the slot buffer to the device or userspace side.
    pub fn shared(&self) -> SlotBuffer {
        Arc::clone(&self.slots)
    }
}
