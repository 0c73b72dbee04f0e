/// Number of signal slots reserved per process.
pub const SIGNAL_EVENT_LIMIT: u32 = 4096;

/// Slot value meaning "not signaled since the last acknowledge".
pub const UNSIGNALED: u64 = u64::MAX;

/// Slots mapped by the oldest supported runtime (2 KiB signal page).
pub const DEFAULT_MAPPED_SLOTS: u32 = 256;

/// Last id handed out to events that do not own a signal slot.
pub const LAST_NONSIGNAL_EVENT_ID: u32 = 0x7fff_ffff;

/// Offset token returned to userspace: map the signal page through the
/// events mmap type rather than a literal offset.
pub const EVENTS_MMAP_TOKEN: u64 = 2 << 62;

/// Tunables of the event engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventConfig {
    /// Number of slots in a signal page.
    pub signal_event_limit: u32,
    /// Slots userspace is assumed to have mapped before it calls mmap.
    pub default_mapped_slots: u32,
    /// The exhaustive interrupt search walks live events instead of the slot
    /// array while `signal_event_count < signal_event_limit / divisor`.
    pub exhaustive_scan_divisor: u32,
    /// Send a terminate signal when a device exception finds no listener.
    pub sigterm_on_unhandled_exception: bool,
}

/// The implemention for EventConfig
impl EventConfig {
    /// Creates the default configuration.
    pub const fn new() -> Self {
        Self {
            signal_event_limit: SIGNAL_EVENT_LIMIT,
            default_mapped_slots: DEFAULT_MAPPED_SLOTS,
            exhaustive_scan_divisor: 64,
            sigterm_on_unhandled_exception: false,
        }
    }

    /// Overrides the number of slots in a signal page.
    ///
    /// The default mapped size is clamped so it never exceeds the page.
    pub const fn with_signal_event_limit(mut self, limit: u32) -> Self {
        self.signal_event_limit = limit;
        if self.default_mapped_slots > limit {
            self.default_mapped_slots = limit;
        }
        self
    }

    /// Overrides the number of slots assumed mapped before mmap.
    pub const fn with_default_mapped_slots(mut self, slots: u32) -> Self {
        self.default_mapped_slots = slots;
        self
    }

    /// Overrides the exhaustive interrupt search threshold divisor.
    pub const fn with_exhaustive_scan_divisor(mut self, divisor: u32) -> Self {
        self.exhaustive_scan_divisor = divisor;
        self
    }

    /// Enables or disables terminate-on-unhandled-exception.
    pub const fn with_sigterm_on_unhandled_exception(mut self, enable: bool) -> Self {
        self.sigterm_on_unhandled_exception = enable;
        self
    }

    /// First id of the non-signal range. It starts right after the slots so
    /// that id-range scans for non-signal events never see a slot index.
    pub const fn first_nonsignal_event_id(&self) -> u32 {
        self.signal_event_limit
    }

    /// Size in bytes of a full signal page.
    pub const fn signal_page_size(&self) -> usize {
        self.signal_event_limit as usize * 8
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self::new()
    }
}
