//! Filter registry: owns the live filters of one session.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use secfilter_protocol::{FilterError, FilterFormat, FilterHandle, FilterState, DEFAULT_MAX_FILTERS};

use super::{Filter, OwnerContext};

#[derive(Debug)]
struct Slot {
    generation: u32,
    filter: Option<Arc<Filter>>,
}

/// Arena of filter slots keyed by generation-checked handles.
///
/// The lock is only held for map mutation and lookup, never while a
/// callback runs.
pub struct FilterRegistry {
    slots: Mutex<Vec<Slot>>,
    max_filters: usize,
}

impl FilterRegistry {
    /// Create a registry allowing `max_filters` concurrent filters.
    pub fn new(max_filters: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_filters)),
            max_filters,
        }
    }

    /// Maximum number of concurrent filters.
    pub fn max_filters(&self) -> usize {
        self.max_filters
    }

    /// Register a new filter in state `Open`.
    pub fn create(
        &self,
        pid: u16,
        format: FilterFormat,
        owner_context: OwnerContext,
    ) -> Result<Arc<Filter>, FilterError> {
        let mut slots = self.slots.lock();

        let live = slots.iter().filter(|s| s.filter.is_some()).count();
        if live >= self.max_filters {
            warn!(
                "[FilterRegistry] At capacity ({}/{}), cannot create filter",
                live, self.max_filters
            );
            return Err(FilterError::OutOfHandles {
                max: self.max_filters,
            });
        }

        let index = match slots.iter().position(|s| s.filter.is_none()) {
            Some(index) => index,
            None => {
                slots.push(Slot {
                    generation: 0,
                    filter: None,
                });
                slots.len() - 1
            }
        };

        let slot = &mut slots[index];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        let handle = FilterHandle::new(index as u32, slot.generation);
        let filter = Filter::new(handle, pid, format, owner_context);
        slot.filter = Some(Arc::clone(&filter));

        info!(
            "[FilterRegistry] Created filter {} (PID 0x{:04X}, {})",
            handle,
            pid,
            format.name()
        );
        Ok(filter)
    }

    /// Look up a live filter.
    pub fn lookup(&self, handle: FilterHandle) -> Option<Arc<Filter>> {
        let slots = self.slots.lock();
        slots
            .get(handle.index() as usize)
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.filter.clone())
    }

    /// Remove a filter and mark it `Closed` under the same lock.
    ///
    /// Returns the filter and the state it was in.
    pub fn remove(&self, handle: FilterHandle) -> Result<(Arc<Filter>, FilterState), FilterError> {
        let mut slots = self.slots.lock();
        let filter = slots
            .get_mut(handle.index() as usize)
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.filter.take())
            .ok_or(FilterError::InvalidHandle)?;

        let prev = filter.set_state(FilterState::Closed);
        debug!("[FilterRegistry] Removed filter {} (was {})", handle, prev);
        Ok((filter, prev))
    }

    /// Number of live filters.
    pub fn count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.filter.is_some()).count()
    }

    /// Handles of all live filters.
    pub fn handles(&self) -> Vec<FilterHandle> {
        self.slots
            .lock()
            .iter()
            .filter_map(|s| s.filter.as_ref().map(|f| f.handle()))
            .collect()
    }

    /// Snapshot of all live filters.
    pub fn filters(&self) -> Vec<Arc<Filter>> {
        self.slots
            .lock()
            .iter()
            .filter_map(|s| s.filter.clone())
            .collect()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILTERS)
    }
}
