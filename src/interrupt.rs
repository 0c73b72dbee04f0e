//! Signal interrupt dispatch.
//!
//! A signal interrupt carries the id of the event the device signaled, but
//! the payload may only have room for the low `valid_id_bits` bits of it.
//! Resolution goes in three steps:
//!
//! 1. **Full precision**: `2^valid_id_bits` covers every slot, so the id is
//!    exact. Its slot is checked and the event resolved directly.
//! 2. **Partial id**: candidate slots `id, id + 2^bits, id + 2 * 2^bits, ...`
//!    are checked and the first signaled one wins. This assumes at most one
//!    of the colliding events is signaled at a time.
//! 3. **Exhaustive search**: when the partial lookup found nothing, every
//!    signaled slot is processed. With few live signal events the live
//!    events are walked; otherwise the slot array is walked. Both produce the
//!    same result.
//!
//! Every resolved event has its slot acknowledged and is then set.

use crate::table::{EventTable, TableInner};

impl TableInner {
    /// Resolves a possibly truncated id to a signaled, device-signalable event.
    fn lookup_signaled_by_partial_id(&self, partial_id: u32, valid_id_bits: u32) -> Option<u32> {
        let page = self.signal_page.as_ref()?;
        let capacity = page.capacity() as u64;

        // Only the lower bits are valid when the id space exceeds the payload.
        if valid_id_bits > 31 || (1u64 << valid_id_bits) >= capacity {
            if !page.is_signaled(partial_id as usize) {
                return None;
            }
            return self.event(partial_id).map(|event| event.id());
        }

        let stride = 1u64 << valid_id_bits;
        let mut id = partial_id as u64 & (stride - 1);
        while id < capacity {
            if page.is_signaled(id as usize) {
                if let Some(event) = self.event(id as u32) {
                    return Some(event.id());
                }
            }
            id += stride;
        }
        None
    }

    /// Acknowledges the slot of `id` and sets the event. Returns `false` if
    /// the event cannot be signaled by the device.
    fn set_event_from_interrupt(&mut self, id: u32) -> bool {
        if !self.event(id).is_some_and(|event| event.kind().uses_signal_slot()) {
            return false;
        }
        if let Some(page) = self.signal_page.as_ref() {
            page.acknowledge(id as usize);
        }
        if let Some(event) = self.event_mut(id) {
            event.set();
        }
        true
    }

    /// Signals every event whose slot is signaled.
    fn signal_all_signaled_slots(&mut self) -> usize {
        let Some(page) = self.signal_page.as_ref() else {
            return 0;
        };
        let capacity = page.capacity();
        let divisor = self.config.exhaustive_scan_divisor.max(1) as usize;

        let mut signaled = 0;
        if (self.signal_event_count as usize) < capacity / divisor {
            // Few events: walk the live events and check their slots.
            for event in self.signal_events.values_mut() {
                let id = event.id() as usize;
                if page.is_signaled(id) {
                    page.acknowledge(id);
                    event.set();
                    signaled += 1;
                }
            }
        } else {
            // Many events: walk the slots and resolve only signaled ones.
            for id in 0..capacity {
                if !page.is_signaled(id) {
                    continue;
                }
                if let Some(event) = self.signal_events.get_mut(id as u32) {
                    page.acknowledge(id);
                    event.set();
                    signaled += 1;
                }
            }
        }
        signaled
    }
}

/// Resolves interrupt-delivered ids of one process to events and signals them.
pub struct InterruptDispatcher<'a> {
    table: &'a EventTable,
}

impl<'a> InterruptDispatcher<'a> {
    pub fn new(table: &'a EventTable) -> Self {
        Self { table }
    }

    /// Handles one signal interrupt. Returns the number of events signaled.
    ///
    /// Must be called from a context that may take the table lock; interrupt
    /// handlers go through [`ProcessRegistry::on_interrupt`](crate::ProcessRegistry::on_interrupt).
    ///
    /// # Arguments
    ///
    /// * `partial_id` - Event id from the interrupt payload.
    /// * `valid_id_bits` - How many low bits of `partial_id` are valid; 0 if unknown.
    pub fn signal(&self, partial_id: u32, valid_id_bits: u32) -> usize {
        let mut inner = self.table.lock();

        let resolved = if valid_id_bits != 0 {
            inner.lookup_signaled_by_partial_id(partial_id, valid_id_bits)
        } else {
            None
        };

        match resolved {
            Some(id) => {
                trace!("Interrupt id {:#x}/{} resolved to event {:#x}", partial_id, valid_id_bits, id);
                usize::from(inner.set_event_from_interrupt(id))
            }
            None => {
                // The id in the payload was unusable; search every signaled slot.
                let signaled = inner.signal_all_signaled_slots();
                trace!(
                    "Interrupt id {:#x}/{} unresolved, exhaustive search signaled {}",
                    partial_id,
                    valid_id_bits,
                    signaled
                );
                signaled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventConfig, UNSIGNALED};
    use crate::event::EventKind;
    use core::sync::atomic::Ordering;

    fn table_with_page(config: EventConfig) -> EventTable {
        let table = EventTable::new(config.with_signal_event_limit(64));
        table.create_event(EventKind::Signal, false, None).unwrap();
        table
    }

    fn raise(table: &EventTable, id: u32) {
        table.signal_page_buffer().unwrap()[id as usize].store(0, Ordering::Release);
    }

    #[test]
    fn test_full_precision_lookup() {
        let table = table_with_page(EventConfig::new());
        for _ in 0..9 {
            table.create_event(EventKind::Signal, false, None).unwrap();
        }
        raise(&table, 7);

        let dispatcher = InterruptDispatcher::new(&table);
        assert_eq!(dispatcher.signal(7, 32), 1);
        assert!(table.lookup(7).unwrap().signaled);
        assert_eq!(table.signal_page_buffer().unwrap()[7].load(Ordering::Acquire), UNSIGNALED);
    }

    #[test]
    fn test_partial_id_lookup() {
        let table = table_with_page(EventConfig::new());
        for _ in 0..39 {
            table.create_event(EventKind::Signal, false, None).unwrap();
        }
        // 37 = 0b100101, only 4 bits valid -> candidates 5, 21, 37, 53
        raise(&table, 37);

        let dispatcher = InterruptDispatcher::new(&table);
        assert_eq!(dispatcher.signal(37 & 0xf, 4), 1);
        assert!(table.lookup(37).unwrap().signaled);
        assert!(!table.lookup(5).unwrap().signaled);
        assert!(!table.lookup(21).unwrap().signaled);
    }

    #[test]
    fn test_exhaustive_search_registry_walk() {
        // 3 live events < 64 / 2: walk the registry
        let table = table_with_page(EventConfig::new().with_exhaustive_scan_divisor(2));
        table.create_event(EventKind::Signal, false, None).unwrap();
        table.create_event(EventKind::Signal, false, None).unwrap();
        raise(&table, 1);
        raise(&table, 2);
        raise(&table, 50); // no event behind it

        assert_eq!(InterruptDispatcher::new(&table).signal(0, 0), 2);
        assert!(table.lookup(1).unwrap().signaled);
        assert!(table.lookup(2).unwrap().signaled);
        assert_ne!(table.signal_page_buffer().unwrap()[50].load(Ordering::Acquire), UNSIGNALED);
    }

    #[test]
    fn test_exhaustive_search_slot_walk() {
        // 64 / 64 = 1, so three live events take the slot walk
        let table = table_with_page(EventConfig::new());
        table.create_event(EventKind::Signal, false, None).unwrap();
        table.create_event(EventKind::Signal, false, None).unwrap();
        raise(&table, 1);
        raise(&table, 2);
        raise(&table, 50);

        assert_eq!(InterruptDispatcher::new(&table).signal(0, 0), 2);
        assert!(table.lookup(1).unwrap().signaled);
        assert!(table.lookup(2).unwrap().signaled);
        assert!(!table.lookup(0).unwrap().signaled);
        assert_ne!(table.signal_page_buffer().unwrap()[50].load(Ordering::Acquire), UNSIGNALED);
    }

    #[test]
    fn test_partial_miss_falls_back() {
        // Candidates of 3/2 bits are 3, 7, 11, ...; the signaled slot is 2
        let table = table_with_page(EventConfig::new());
        for _ in 0..4 {
            table.create_event(EventKind::Signal, false, None).unwrap();
        }
        raise(&table, 2);

        assert_eq!(InterruptDispatcher::new(&table).signal(3, 2), 1);
        assert!(table.lookup(2).unwrap().signaled);
    }

    #[test]
    fn test_no_page_no_signal() {
        let table = EventTable::new(EventConfig::default());
        assert_eq!(InterruptDispatcher::new(&table).signal(3, 32), 0);
    }
}
