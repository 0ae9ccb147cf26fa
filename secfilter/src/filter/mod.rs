//! Section filters: the per-filter object, the registry that owns them and
//! the engine that drives their state machine and buffer exchange.
//!
//! This module provides:
//! - [`FilterRegistry`]: generation-checked handle arena with a concurrency limit
//! - [`FilterEngine`]: filter API, demux control and the two-phase delivery
//! - [`FilterCallbacks`]: the client's `on_buffer_needed` / `on_section` pair

pub mod engine;
pub mod registry;

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::debug;
use parking_lot::Mutex;
use secfilter_protocol::{FilterError, FilterFormat, FilterHandle, FilterState, SectionStatus};
use serde::Serialize;

pub use engine::{DeliveryOutcome, FilterEngine};
pub use registry::FilterRegistry;

/// Caller data handed back on every callback.
pub type OwnerContext = Arc<dyn Any + Send + Sync>;

/// Query phase: return a buffer able to hold `len` bytes.
pub type BufferNeededFn =
    Box<dyn FnMut(&OwnerContext, FilterHandle, usize) -> Result<BytesMut, FilterError> + Send>;

/// Delivery phase: receives the buffer back holding `len` bytes.
pub type SectionFn = Box<dyn FnMut(&OwnerContext, FilterHandle, SectionStatus, BytesMut, usize) + Send>;

/// The client's callback pair for one started filter.
pub struct FilterCallbacks {
    pub on_buffer_needed: BufferNeededFn,
    pub on_section: SectionFn,
}

impl FilterCallbacks {
    pub fn new<B, S>(on_buffer_needed: B, on_section: S) -> Self
    where
        B: FnMut(&OwnerContext, FilterHandle, usize) -> Result<BytesMut, FilterError> + Send + 'static,
        S: FnMut(&OwnerContext, FilterHandle, SectionStatus, BytesMut, usize) + Send + 'static,
    {
        Self {
            on_buffer_needed: Box::new(on_buffer_needed),
            on_section: Box::new(on_section),
        }
    }
}

impl std::fmt::Debug for FilterCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterCallbacks").finish_non_exhaustive()
    }
}

/// Options for `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartParams {
    /// Report [`SectionStatus::Timeout`] when no section arrives within this period.
    pub timeout: Option<Duration>,
    /// Stop automatically after the first delivered section.
    pub one_shot: bool,
    /// Drop sections whose CRC-32 does not check (section format only).
    pub enable_crc: bool,
}

/// Per-filter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub delivered: u64,
    pub tardy: u64,
    pub rejected_buffers: u64,
    pub crc_errors: u64,
    pub oversized: u64,
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    delivered: AtomicU64,
    tardy: AtomicU64,
    rejected_buffers: AtomicU64,
    crc_errors: AtomicU64,
    oversized: AtomicU64,
    timeouts: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> FilterStats {
        FilterStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            tardy: self.tardy.load(Ordering::Relaxed),
            rejected_buffers: self.rejected_buffers.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A live section filter.
///
/// The state is an atomic so the delivery path can re-check it after the
/// query phase without taking any lock the filter API uses.
pub struct Filter {
    handle: FilterHandle,
    pid: u16,
    format: FilterFormat,
    owner_context: OwnerContext,
    state: AtomicU8,
    params: Mutex<StartParams>,
    /// Serializes set/start/stop/destroy on this filter.
    control: Mutex<()>,
    /// Callbacks registered by `start`, picked up by the next delivery.
    pending: Mutex<Option<FilterCallbacks>>,
    /// Held for a whole query/delivery pair.
    delivery: Mutex<Option<FilterCallbacks>>,
    deadline: Mutex<Option<Instant>>,
    stats: StatCounters,
}

impl Filter {
    pub(crate) fn new(
        handle: FilterHandle,
        pid: u16,
        format: FilterFormat,
        owner_context: OwnerContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            pid,
            format,
            owner_context,
            state: AtomicU8::new(FilterState::Open as u8),
            params: Mutex::new(StartParams::default()),
            control: Mutex::new(()),
            pending: Mutex::new(None),
            delivery: Mutex::new(None),
            deadline: Mutex::new(None),
            stats: StatCounters::default(),
        })
    }

    pub fn handle(&self) -> FilterHandle {
        self.handle
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn format(&self) -> FilterFormat {
        self.format
    }

    pub fn owner_context(&self) -> &OwnerContext {
        &self.owner_context
    }

    pub fn state(&self) -> FilterState {
        FilterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> FilterStats {
        self.stats.snapshot()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == FilterState::Running
    }

    pub(crate) fn set_state(&self, state: FilterState) -> FilterState {
        let prev = FilterState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            debug!("[Filter] {} {} -> {}", self.handle, prev, state);
        }
        prev
    }

    /// Atomically move `from -> to`; false when the filter was not in `from`.
    pub(crate) fn transition(&self, from: FilterState, to: FilterState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!("[Filter] {} {} -> {}", self.handle, from, to);
        }
        moved
    }

    fn arm_deadline(&self, now: Instant, timeout: Option<Duration>) {
        *self.deadline.lock() = timeout.map(|t| now + t);
    }

    fn deadline_elapsed(&self, now: Instant) -> bool {
        matches!(*self.deadline.lock(), Some(deadline) if now >= deadline)
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("handle", &self.handle)
            .field("pid", &format_args!("0x{:04X}", self.pid))
            .field("format", &self.format)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        debug!("[Filter] {} dropped", self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> Arc<Filter> {
        Filter::new(FilterHandle::new(0, 1), 0x0100, FilterFormat::Section, Arc::new(()))
    }

    #[test]
    fn test_new_filter_is_open() {
        let filter = filter();
        assert_eq!(filter.state(), FilterState::Open);
        assert_eq!(filter.stats(), FilterStats::default());
        assert_eq!(filter.pid(), 0x0100);
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let filter = filter();
        assert!(!filter.transition(FilterState::Running, FilterState::Stopped));
        assert_eq!(filter.set_state(FilterState::Running), FilterState::Open);
        assert!(filter.transition(FilterState::Running, FilterState::Stopped));
        assert!(!filter.transition(FilterState::Running, FilterState::Stopped));
        assert_eq!(filter.state(), FilterState::Stopped);
    }

    #[test]
    fn test_deadline() {
        let filter = filter();
        let now = Instant::now();
        assert!(!filter.deadline_elapsed(now));

        filter.arm_deadline(now, Some(Duration::from_millis(10)));
        assert!(!filter.deadline_elapsed(now));
        assert!(filter.deadline_elapsed(now + Duration::from_millis(10)));

        filter.arm_deadline(now, None);
        assert!(!filter.deadline_elapsed(now + Duration::from_secs(1)));
    }
}
