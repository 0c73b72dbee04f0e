//! Per-process event registry.
//!
//! The table is the authoritative owner of every event of a process and of
//! the process's signal page. All mutations are serialised by one coarse
//! lock; contention is expected to be low, and only the wait path ever
//! sleeps, and it does so after releasing the lock.
//!
//! # Id ranges
//!
//! | Kinds           | Ids                                      |
//! |-----------------|------------------------------------------|
//! | Signal, Debug   | `[0, mapped_slots)`, equal to slot index |
//! | everything else | `[signal_event_limit, 0x7fff_ffff]`      |

use spin::{Mutex, MutexGuard};

use axerrno::{ax_err, AxError, AxResult};

use crate::config::{EventConfig, LAST_NONSIGNAL_EVENT_ID};
use crate::event::{Event, EventInfo, EventKind};
use crate::ids::IdArena;
use crate::page::{SignalMemory, SignalPage, SlotBuffer};

/// State protected by the table lock.
pub(crate) struct TableInner {
    pub(crate) config: EventConfig,
    /// Signal and debug events, keyed by slot index.
    pub(crate) signal_events: IdArena<Event>,
    /// All other events.
    pub(crate) other_events: IdArena<Event>,
    pub(crate) signal_page: Option<SignalPage>,
    /// Live signal and debug events.
    pub(crate) signal_event_count: u32,
    /// Set once the signal id range was found exhausted, to log it once.
    signal_limit_reached: bool,
    next_serial: u64,
}

impl TableInner {
    fn new(config: EventConfig) -> Self {
        let limit = config.signal_event_limit;
        Self {
            config,
            signal_events: IdArena::new(0, limit.saturating_sub(1)),
            other_events: IdArena::new(config.first_nonsignal_event_id(), LAST_NONSIGNAL_EVENT_ID),
            signal_page: None,
            signal_event_count: 0,
            signal_limit_reached: false,
            next_serial: 0,
        }
    }

    pub(crate) fn event(&self, id: u32) -> Option<&Event> {
        if id < self.config.signal_event_limit {
            self.signal_events.get(id)
        } else {
            self.other_events.get(id)
        }
    }

    pub(crate) fn event_mut(&mut self, id: u32) -> Option<&mut Event> {
        if id < self.config.signal_event_limit {
            self.signal_events.get_mut(id)
        } else {
            self.other_events.get_mut(id)
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.signal_events.len() + self.other_events.len()
    }

    /// All events in ascending id order.
    pub(crate) fn events(&self) -> impl Iterator<Item = &Event> {
        self.signal_events.values().chain(self.other_events.values())
    }

    /// First event with an id `>= start`.
    pub(crate) fn next_event_from(&self, start: u32) -> Option<&Event> {
        if start < self.config.signal_event_limit {
            if let Some((_, event)) = self.signal_events.next_from(start) {
                return Some(event);
            }
        }
        self.other_events.next_from(start).map(|(_, event)| event)
    }

    pub(crate) fn bind_signal_page(&mut self, page: SignalPage) -> AxResult {
        if self.signal_page.is_some() {
            return ax_err!(ResourceBusy, "Event page is already set");
        }
        self.signal_page = Some(page);
        Ok(())
    }

    /// Allocates the signal page on first use.
    fn ensure_signal_page(&mut self) -> AxResult<&SignalPage> {
        if self.signal_page.is_none() {
            let page = SignalPage::allocate(
                self.config.signal_event_limit as usize,
                self.config.default_mapped_slots as usize * 8,
            )?;
            self.signal_page = Some(page);
        }
        match self.signal_page.as_ref() {
            Some(page) => Ok(page),
            None => ax_err!(BadState, "Signal page missing"),
        }
    }

    pub(crate) fn create_event(
        &mut self,
        kind: EventKind,
        auto_reset: bool,
        restore_id: Option<u32>,
    ) -> AxResult<u32> {
        let serial = self.next_serial;
        let id = if kind.uses_signal_slot() {
            self.create_signal_event(kind, auto_reset, restore_id, serial)?
        } else {
            self.create_other_event(kind, auto_reset, restore_id, serial)?
        };
        self.next_serial += 1;

        debug!("Created event {:#x} kind {:?} auto_reset {}", id, kind, auto_reset);
        Ok(id)
    }

    fn create_signal_event(
        &mut self,
        kind: EventKind,
        auto_reset: bool,
        restore_id: Option<u32>,
        serial: u64,
    ) -> AxResult<u32> {
        let page = self.ensure_signal_page()?;
        let capacity = page.capacity() as u32;
        let mapped_slots = page.mapped_slots() as u32;

        let id = match restore_id {
            Some(id) => {
                if id >= capacity {
                    return ax_err!(InvalidInput, "Restored signal id beyond signal page");
                }
                self.signal_events
                    .insert_at(id, Event::new(id, serial, kind, auto_reset))?;
                id
            }
            None => {
                let allocated = self
                    .signal_events
                    .alloc_with(mapped_slots, |id| Event::new(id, serial, kind, auto_reset));
                match allocated {
                    Ok(id) => id,
                    Err(AxError::StorageFull) => {
                        if !self.signal_limit_reached {
                            self.signal_limit_reached = true;
                            warn!(
                                "Signal event wasn't created because limit was reached ({} slots mapped)",
                                mapped_slots
                            );
                        }
                        return Err(AxError::StorageFull);
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        if let Some(page) = self.signal_page.as_ref() {
            page.acknowledge(id as usize);
        }
        self.signal_event_count += 1;
        Ok(id)
    }

    fn create_other_event(
        &mut self,
        kind: EventKind,
        auto_reset: bool,
        restore_id: Option<u32>,
        serial: u64,
    ) -> AxResult<u32> {
        match restore_id {
            Some(id) => {
                self.other_events
                    .insert_at(id, Event::new(id, serial, kind, auto_reset))?;
                Ok(id)
            }
            None => match self
                .other_events
                .alloc_with(u32::MAX, |id| Event::new(id, serial, kind, auto_reset))
            {
                Err(AxError::StorageFull) => ax_err!(StorageFull, "Non-signal event ids exhausted"),
                other => other,
            },
        }
    }

    pub(crate) fn destroy_event(&mut self, id: u32) -> AxResult {
        let removed = if id < self.config.signal_event_limit {
            self.signal_events.remove(id)
        } else {
            self.other_events.remove(id)
        };
        let Some(mut event) = removed else {
            return ax_err!(InvalidInput, "Event not found");
        };

        event.sever_waiters();
        if event.kind().uses_signal_slot() {
            self.signal_event_count -= 1;
        }

        debug!("Destroyed event {:#x}", id);
        Ok(())
    }

    /// Destroys every event and drops the signal page.
    pub(crate) fn clear(&mut self) {
        for mut event in self.signal_events.drain().chain(self.other_events.drain()) {
            event.sever_waiters();
        }
        self.signal_event_count = 0;
        self.signal_page = None;
    }
}

/// Per-process event registry.
///
/// # Usage
///
/// ```rust,ignore
/// let table = EventTable::new(EventConfig::default());
///
/// let id = table.create_event(EventKind::Signal, true, None)?;
/// table.set_event(id)?;
/// assert!(table.lookup(id).unwrap().signaled);
/// table.destroy_event(id)?;
/// ```
pub struct EventTable {
    inner: Mutex<TableInner>,
}

impl EventTable {
    /// Creates an empty table.
    pub fn new(config: EventConfig) -> Self {
        Self {
            inner: Mutex::new(TableInner::new(config)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock()
    }

    /// The configuration the table was created with.
    pub fn config(&self) -> EventConfig {
        self.inner.lock().config
    }

    /// Creates an event.
    ///
    /// Signal and debug events allocate the signal page on first use and get
    /// an id below the number of slots userspace has mapped. With
    /// `restore_id`, exactly that id is allocated.
    ///
    /// # Arguments
    ///
    /// * `kind` - The event kind.
    /// * `auto_reset` - Clear the signaled state when a wait observes it.
    /// * `restore_id` - Id to recreate during snapshot restore.
    ///
    /// # Errors
    ///
    /// - `StorageFull` if the signal id range is exhausted (logged once).
    /// - `NoMemory` if the page or the registry cannot grow.
    /// - `InvalidInput` if `restore_id` is taken or outside its range.
    pub fn create_event(&self, kind: EventKind, auto_reset: bool, restore_id: Option<u32>) -> AxResult<u32> {
        self.inner.lock().create_event(kind, auto_reset, restore_id)
    }

    /// Destroys an event, waking its waiters with a failed wait.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the event does not exist.
    pub fn destroy_event(&self, id: u32) -> AxResult {
        self.inner.lock().destroy_event(id)
    }

    /// Signals an event from the CPU.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the event does not exist or is not a signal event.
    pub fn set_event(&self, id: u32) -> AxResult {
        let mut inner = self.inner.lock();
        match inner.event_mut(id) {
            Some(event) if event.kind().is_cpu_signalable() => {
                event.set();
                Ok(())
            }
            _ => ax_err!(InvalidInput, "Event can't be set"),
        }
    }

    /// Clears an event's signaled state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the event does not exist or is not a signal event.
    pub fn reset_event(&self, id: u32) -> AxResult {
        let mut inner = self.inner.lock();
        match inner.event_mut(id) {
            Some(event) if event.kind().is_cpu_signalable() => {
                event.reset();
                Ok(())
            }
            _ => ax_err!(InvalidInput, "Event can't be reset"),
        }
    }

    /// Returns a copy of an event's state.
    pub fn lookup(&self, id: u32) -> Option<EventInfo> {
        self.inner.lock().event(id).map(Event::info)
    }

    /// Number of live events.
    pub fn count(&self) -> u32 {
        self.inner.lock().count() as u32
    }

    /// Number of live signal and debug events.
    pub fn signal_event_count(&self) -> u32 {
        self.inner.lock().signal_event_count
    }

    /// Iterates events with ids `>= start_id`.
    ///
    /// The cursor takes the lock per step, so the table may change between
    /// items; the sequence can be resumed from any id.
    pub fn iter_from(&self, start_id: u32) -> EventCursor<'_> {
        EventCursor {
            table: self,
            next: Some(start_id),
        }
    }

    /// Binds a buffer the memory layer already mapped as the signal page.
    ///
    /// # Errors
    ///
    /// - `ResourceBusy` if a page is already bound.
    /// - `InvalidInput` if `size` does not fit the buffer.
    pub fn bind_signal_page(&self, slots: SlotBuffer, size: usize, user_handle: u64) -> AxResult {
        let mut inner = self.inner.lock();
        if inner.signal_page.is_some() {
            return ax_err!(ResourceBusy, "Event page is already set");
        }
        let page = SignalPage::bind_external(slots, size, user_handle)?;
        inner.bind_signal_page(page)
    }

    /// Resolves `user_handle` through the memory layer and binds the result.
    ///
    /// # Errors
    ///
    /// As [`bind_signal_page`](Self::bind_signal_page), plus any error of the
    /// memory layer.
    pub fn set_event_page(&self, user_handle: u64, memory: &dyn SignalMemory) -> AxResult {
        if self.inner.lock().signal_page.is_some() {
            return ax_err!(ResourceBusy, "Event page is already set");
        }
        let (slots, size) = memory.map_signal_buffer(user_handle)?;
        self.bind_signal_page(slots, size, user_handle)
    }

    /// Exposes the signal page to userspace.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if there is no page or `requested_len` is larger
    /// than the page.
    pub fn mmap_signal_page(&self, requested_len: usize) -> AxResult {
        match self.inner.lock().signal_page.as_mut() {
            Some(page) => page.mmap(requested_len),
            None => ax_err!(InvalidInput, "Signal page could not be found"),
        }
    }

    /// The shared slot buffer, if a page exists.
    pub fn signal_page_buffer(&self) -> Option<SlotBuffer> {
        self.inner.lock().signal_page.as_ref().map(SignalPage::shared)
    }

    /// Handle of an externally bound page.
    pub fn signal_page_handle(&self) -> Option<u64> {
        self.inner.lock().signal_page.as_ref().and_then(SignalPage::user_handle)
    }

    /// Bytes of the signal page userspace has mapped.
    pub fn signal_mapped_size(&self) -> Option<usize> {
        self.inner.lock().signal_page.as_ref().map(SignalPage::mapped_size)
    }

    /// Destroys every event and releases the signal page.
    pub fn clear(&self) {
        self.inner.lock().clear();
        debug!("Event table cleared");
    }
}

/// Lazy, restartable walk over a table.
pub struct EventCursor<'a> {
    table: &'a EventTable,
    next: Option<u32>,
}

impl Iterator for EventCursor<'_> {
    type Item = EventInfo;

    fn next(&mut self) -> Option<EventInfo> {
        let start = self.next?;
        let info = self.table.inner.lock().next_event_from(start).map(Event::info);
        self.next = info.and_then(|info| info.id.checked_add(1));
        info
    }
}
