//! Filter engine: the filter API, demux control and buffer exchange.
//!
//! Every section goes through a strictly paired exchange:
//!
//! 1. query: `on_buffer_needed(ctx, handle, n)` must return a buffer with
//!    capacity for `n` bytes, otherwise the section is dropped and the
//!    filter keeps running;
//! 2. the filter state is re-checked, so a `stop` issued during the query
//!    turns the delivery into a silent drop;
//! 3. delivery: exactly `n` bytes are copied and `on_section` takes the
//!    buffer.
//!
//! Pairs of one filter never overlap. [`FilterEngine::deliver`] may be
//! called from any producer thread with the same guarantees.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use secfilter_protocol::{
    Comparator, FilterAction, FilterError, FilterFormat, FilterHandle, FilterState, SectionStatus,
    MASK_BYPASS_INDEX, MAX_FILTER_LENGTH, MAX_PID,
};
use secfilter_psi::section_crc_ok;

use super::{Filter, FilterCallbacks, FilterRegistry, FilterStats, OwnerContext, StartParams, StatCounters};
use crate::demux::Demux;

/// What happened to one buffer handed to [`FilterEngine::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// `on_section` received the data.
    Delivered,
    /// The filter stopped between query and delivery.
    Tardy,
    /// `on_buffer_needed` failed or returned a buffer that was too small.
    BufferRejected,
    /// CRC check enabled and the section did not verify.
    CrcMismatch,
    /// Larger than the configured maximum section size.
    Oversized,
    /// The filter exists but is not running.
    NotRunning,
    /// Unknown or closed handle.
    UnknownHandle,
}

/// Filter API over a registry and (once ready) a demultiplexer.
pub struct FilterEngine {
    registry: FilterRegistry,
    demux: RwLock<Option<Arc<dyn Demux>>>,
    max_section_size: usize,
}

impl FilterEngine {
    pub fn new(max_filters: usize, max_section_size: usize) -> Self {
        Self {
            registry: FilterRegistry::new(max_filters),
            demux: RwLock::new(None),
            max_section_size,
        }
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// Store the demultiplexer reference (`on_demux_ready`).
    pub fn attach_demux(&self, demux: Arc<dyn Demux>) {
        if self.demux.write().replace(demux).is_some() {
            warn!("[FilterEngine] Demux replaced while filters may be configured on the old one");
        }
        debug!("[FilterEngine] Demux attached");
    }

    /// Release the demultiplexer reference.
    pub fn detach_demux(&self) -> Option<Arc<dyn Demux>> {
        self.demux.write().take()
    }

    pub fn has_demux(&self) -> bool {
        self.demux.read().is_some()
    }

    fn demux(&self) -> Result<Arc<dyn Demux>, FilterError> {
        self.demux.read().clone().ok_or(FilterError::NotReady)
    }

    fn filter(&self, handle: FilterHandle) -> Result<Arc<Filter>, FilterError> {
        self.registry.lookup(handle).ok_or(FilterError::InvalidHandle)
    }

    /// Create a filter on `pid` (0x1FFF: any PID).
    pub fn create(
        &self,
        pid: u16,
        format: FilterFormat,
        owner_context: OwnerContext,
    ) -> Result<FilterHandle, FilterError> {
        if pid > MAX_PID {
            return Err(FilterError::bad_param(format!("PID 0x{:04X} out of range", pid)));
        }
        let demux = self.demux()?;
        let filter = self.registry.create(pid, format, owner_context)?;
        let handle = filter.handle();

        let programmed = demux
            .set_filter_action(handle, FilterAction::Open)
            .and_then(|_| demux.set_filter_pid(handle, pid))
            .and_then(|_| demux.set_filter_format(handle, format));
        if let Err(e) = programmed {
            warn!("[FilterEngine] Demux rejected filter {}: {}", handle, e);
            if let Err(remove_err) = self.registry.remove(handle) {
                warn!("[FilterEngine] Rolling back {}: {}", handle, remove_err);
            }
            if let Err(close_err) = demux.set_filter_action(handle, FilterAction::Close) {
                warn!("[FilterEngine] Closing rejected filter {}: {}", handle, close_err);
            }
            return Err(e);
        }

        Ok(handle)
    }

    /// Program the value/mask pattern. Valid in `Open`, `Set` and `Stopped`.
    pub fn set(
        &self,
        handle: FilterHandle,
        value: &[u8],
        mask: &[u8],
        comparator: Comparator,
    ) -> Result<(), FilterError> {
        if value.len() != mask.len() {
            return Err(FilterError::bad_param(format!(
                "value length {} != mask length {}",
                value.len(),
                mask.len()
            )));
        }
        if value.is_empty() || value.len() > MAX_FILTER_LENGTH {
            return Err(FilterError::bad_param(format!(
                "filter length {} not in 1..={}",
                value.len(),
                MAX_FILTER_LENGTH
            )));
        }

        let filter = self.filter(handle)?;
        let _control = filter.control.lock();
        let state = filter.state();
        match state {
            FilterState::Closed => return Err(FilterError::InvalidHandle),
            s if !s.can_configure() => {
                return Err(FilterError::WrongState {
                    operation: "set",
                    state: s.name(),
                })
            }
            _ => {}
        }

        // The hardware ignores this byte; it must always reach the demux cleared.
        let mut mask = mask.to_vec();
        if let Some(bypass) = mask.get_mut(MASK_BYPASS_INDEX) {
            *bypass = 0;
        }

        let demux = self.demux()?;
        demux.set_filter_value_mask(handle, value, &mask, comparator)?;
        demux.set_filter_action(handle, FilterAction::Set)?;
        filter.set_state(FilterState::Set);
        Ok(())
    }

    /// Start delivering sections. Valid in `Set` and `Stopped`.
    pub fn start(
        &self,
        handle: FilterHandle,
        params: StartParams,
        callbacks: FilterCallbacks,
    ) -> Result<(), FilterError> {
        let filter = self.filter(handle)?;
        let _control = filter.control.lock();
        let state = filter.state();
        match state {
            FilterState::Closed => return Err(FilterError::InvalidHandle),
            s if !s.can_start() => {
                return Err(FilterError::WrongState {
                    operation: "start",
                    state: s.name(),
                })
            }
            _ => {}
        }
        let demux = self.demux()?;

        *filter.params.lock() = params;
        *filter.pending.lock() = Some(callbacks);
        filter.arm_deadline(Instant::now(), params.timeout);

        // Running before the demux starts, so the first section is not refused.
        filter.set_state(FilterState::Running);
        if let Err(e) = demux.set_filter_action(handle, FilterAction::Start) {
            filter.transition(FilterState::Running, state);
            return Err(e);
        }
        debug!("[FilterEngine] Started {} with {:?}", handle, params);
        Ok(())
    }

    /// Stop a running filter. Stopping a filter that is not running is a no-op.
    ///
    /// Without a demux the state change alone is the stop.
    pub fn stop(&self, handle: FilterHandle) -> Result<(), FilterError> {
        let filter = self.filter(handle)?;
        let _control = filter.control.lock();
        if filter.state() == FilterState::Closed {
            return Err(FilterError::InvalidHandle);
        }
        let demux = self.demux.read().clone();
        if !filter.transition(FilterState::Running, FilterState::Stopped) {
            return Ok(());
        }
        match demux {
            Some(demux) => demux.set_filter_action(handle, FilterAction::Stop),
            None => {
                debug!("[FilterEngine] {} stopped with no demux attached", handle);
                Ok(())
            }
        }
    }

    /// Close a filter from any state; a running filter is stopped first.
    pub fn destroy(&self, handle: FilterHandle) -> Result<(), FilterError> {
        let filter = self.filter(handle)?;
        let _control = filter.control.lock();
        let (filter, prev) = self.registry.remove(handle)?;

        if prev == FilterState::Running {
            debug!("[FilterEngine] {} stopped on close", handle);
        }
        // Clearing the callbacks lets the owner context go; a delivery in
        // flight keeps its own copy until it returns.
        filter.pending.lock().take();
        if let Some(mut delivery) = filter.delivery.try_lock() {
            delivery.take();
        }

        if let Ok(demux) = self.demux() {
            if prev == FilterState::Running {
                demux.set_filter_action(handle, FilterAction::Stop)?;
            }
            demux.set_filter_action(handle, FilterAction::Close)?;
        }
        Ok(())
    }

    pub fn state(&self, handle: FilterHandle) -> Option<FilterState> {
        self.registry.lookup(handle).map(|f| f.state())
    }

    pub fn stats(&self, handle: FilterHandle) -> Option<FilterStats> {
        self.registry.lookup(handle).map(|f| f.stats())
    }

    pub fn live_count(&self) -> usize {
        self.registry.count()
    }

    /// Run one buffer through the query/delivery exchange (`on_buffer_available`).
    pub fn deliver(&self, handle: FilterHandle, data: &[u8]) -> DeliveryOutcome {
        let Some(filter) = self.registry.lookup(handle) else {
            trace!("[FilterEngine] Buffer for unknown filter {} dropped", handle);
            return DeliveryOutcome::UnknownHandle;
        };
        if !filter.is_running() {
            return DeliveryOutcome::NotRunning;
        }

        let n = data.len();
        if n > self.max_section_size {
            StatCounters::bump(&filter.stats.oversized);
            warn!(
                "[FilterEngine] {} section of {} bytes exceeds {} bytes, dropped",
                handle, n, self.max_section_size
            );
            return DeliveryOutcome::Oversized;
        }

        let mut delivery = filter.delivery.lock();
        if let Some(callbacks) = filter.pending.lock().take() {
            *delivery = Some(callbacks);
        }
        // Another producer may have completed a one-shot delivery while we waited.
        if !filter.is_running() {
            return DeliveryOutcome::NotRunning;
        }
        let Some(callbacks) = delivery.as_mut() else {
            return DeliveryOutcome::NotRunning;
        };

        let params = *filter.params.lock();
        if params.enable_crc && filter.format() == FilterFormat::Section && !section_crc_ok(data) {
            StatCounters::bump(&filter.stats.crc_errors);
            debug!("[FilterEngine] {} CRC mismatch, section dropped", handle);
            return DeliveryOutcome::CrcMismatch;
        }

        let ctx = filter.owner_context();
        let mut buffer = match (callbacks.on_buffer_needed)(ctx, handle, n) {
            Ok(buffer) if buffer.capacity() >= n => buffer,
            Ok(buffer) => {
                StatCounters::bump(&filter.stats.rejected_buffers);
                warn!(
                    "[FilterEngine] {} buffer too small ({} < {}), section dropped",
                    handle,
                    buffer.capacity(),
                    n
                );
                return DeliveryOutcome::BufferRejected;
            }
            Err(e) => {
                StatCounters::bump(&filter.stats.rejected_buffers);
                warn!("[FilterEngine] {} buffer request failed: {}", handle, e);
                return DeliveryOutcome::BufferRejected;
            }
        };

        // One-shot filters stop before `on_section`, so the callback may
        // start them again.
        let still_running = if params.one_shot {
            self.finish_one_shot(&filter)
        } else {
            filter.is_running()
        };
        if !still_running {
            StatCounters::bump(&filter.stats.tardy);
            trace!("[FilterEngine] {} stopped during query, section dropped", handle);
            return DeliveryOutcome::Tardy;
        }
        if !params.one_shot {
            filter.arm_deadline(Instant::now(), params.timeout);
        }

        buffer.clear();
        buffer.extend_from_slice(data);
        StatCounters::bump(&filter.stats.delivered);
        (callbacks.on_section)(ctx, handle, SectionStatus::Ok, buffer, n);

        DeliveryOutcome::Delivered
    }

    /// Move a one-shot filter from `Running` to `Stopped` and stop it on the
    /// demux. False when something else stopped it first.
    fn finish_one_shot(&self, filter: &Filter) -> bool {
        let _control = filter.control.lock();
        if !filter.transition(FilterState::Running, FilterState::Stopped) {
            return false;
        }
        if let Some(demux) = self.demux.read().clone() {
            if let Err(e) = demux.set_filter_action(filter.handle(), FilterAction::Stop) {
                warn!("[FilterEngine] {} one-shot stop failed: {}", filter.handle(), e);
            }
        }
        true
    }

    /// Report a timeout for every running filter whose period elapsed
    /// without a section. Returns the number of timeouts reported.
    pub fn poll_timeouts(&self, now: Instant) -> usize {
        let mut fired = 0;
        for filter in self.registry.filters() {
            if !filter.is_running() || !filter.deadline_elapsed(now) {
                continue;
            }

            let mut delivery = filter.delivery.lock();
            if let Some(callbacks) = filter.pending.lock().take() {
                *delivery = Some(callbacks);
            }
            if !filter.is_running() {
                continue;
            }
            let Some(callbacks) = delivery.as_mut() else {
                continue;
            };

            let params = *filter.params.lock();
            filter.arm_deadline(now, params.timeout);
            StatCounters::bump(&filter.stats.timeouts);
            debug!("[FilterEngine] {} timed out", filter.handle());
            (callbacks.on_section)(
                filter.owner_context(),
                filter.handle(),
                SectionStatus::Timeout,
                BytesMut::new(),
                0,
            );
            fired += 1;
        }
        fired
    }

    /// Close every live filter. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for handle in self.registry.handles() {
            match self.destroy(handle) {
                Ok(()) => closed += 1,
                Err(FilterError::InvalidHandle) => {}
                Err(e) => {
                    // Already out of the registry; only the demux call failed.
                    warn!("[FilterEngine] Closing {}: {}", handle, e);
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            info!("[FilterEngine] Closed {} filter(s)", closed);
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use secfilter_protocol::PID_ANY;
    use std::time::Duration;

    use crate::test_support::pat_section;

    /// Demux double recording every control call.
    #[derive(Default)]
    struct RecordingDemux {
        calls: Mutex<Vec<String>>,
        masks: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingDemux {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Demux for RecordingDemux {
        fn set_filter_action(&self, handle: FilterHandle, action: FilterAction) -> Result<(), FilterError> {
            self.calls.lock().push(format!("{} {:?}", handle, action));
            Ok(())
        }

        fn set_filter_pid(&self, handle: FilterHandle, pid: u16) -> Result<(), FilterError> {
            self.calls.lock().push(format!("{} pid 0x{:04X}", handle, pid));
            Ok(())
        }

        fn set_filter_format(&self, handle: FilterHandle, format: FilterFormat) -> Result<(), FilterError> {
            self.calls.lock().push(format!("{} format {}", handle, format.name()));
            Ok(())
        }

        fn set_filter_value_mask(
            &self,
            _handle: FilterHandle,
            _value: &[u8],
            mask: &[u8],
            _comparator: Comparator,
        ) -> Result<(), FilterError> {
            self.masks.lock().push(mask.to_vec());
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Query(usize),
        Section(SectionStatus, Vec<u8>, usize),
    }

    type Log = Arc<Mutex<Vec<Event>>>;

    fn engine() -> (Arc<FilterEngine>, Arc<RecordingDemux>) {
        let engine = Arc::new(FilterEngine::new(3, 4096));
        let demux = Arc::new(RecordingDemux::default());
        engine.attach_demux(demux.clone());
        (engine, demux)
    }

    fn recording_callbacks(log: &Log) -> FilterCallbacks {
        let query_log = Arc::clone(log);
        let section_log = Arc::clone(log);
        FilterCallbacks::new(
            move |_ctx, _handle, n| {
                query_log.lock().push(Event::Query(n));
                Ok(BytesMut::with_capacity(n))
            },
            move |_ctx, _handle, status, buffer, n| {
                section_log.lock().push(Event::Section(status, buffer.to_vec(), n));
            },
        )
    }

    fn started(engine: &FilterEngine, params: StartParams, log: &Log) -> FilterHandle {
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
        engine.set(handle, &[0x00], &[0xFF], Comparator::Equal).unwrap();
        engine.start(handle, params, recording_callbacks(log)).unwrap();
        handle
    }

    #[test]
    fn test_create_requires_demux() {
        let engine = FilterEngine::new(3, 4096);
        assert_eq!(
            engine.create(0x0000, FilterFormat::Section, Arc::new(())),
            Err(FilterError::NotReady)
        );
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn test_create_rejects_pid_out_of_range() {
        let (engine, _demux) = engine();
        assert!(matches!(
            engine.create(0x2000, FilterFormat::Section, Arc::new(())),
            Err(FilterError::BadParam(_))
        ));
        assert!(engine.create(PID_ANY, FilterFormat::TsPacket, Arc::new(())).is_ok());
    }

    #[test]
    fn test_create_programs_demux() {
        let (engine, demux) = engine();
        let handle = engine.create(0x0065, FilterFormat::Section, Arc::new(())).unwrap();
        assert_eq!(engine.state(handle), Some(FilterState::Open));
        assert_eq!(
            demux.calls(),
            vec![
                format!("{} Open", handle),
                format!("{} pid 0x0065", handle),
                format!("{} format Section", handle),
            ]
        );
    }

    #[test]
    fn test_set_validates_pattern() {
        let (engine, _demux) = engine();
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();

        for (value, mask) in [
            (vec![0x00, 0x01], vec![0xFF]),
            (vec![], vec![]),
            (vec![0; MAX_FILTER_LENGTH + 1], vec![0; MAX_FILTER_LENGTH + 1]),
        ] {
            assert!(matches!(
                engine.set(handle, &value, &mask, Comparator::Equal),
                Err(FilterError::BadParam(_))
            ));
        }
        assert_eq!(engine.state(handle), Some(FilterState::Open));

        let full = vec![0u8; MAX_FILTER_LENGTH];
        engine.set(handle, &full, &full, Comparator::NotEqual).unwrap();
        assert_eq!(engine.state(handle), Some(FilterState::Set));
    }

    #[test]
    fn test_mask_bypass_byte_forced_to_zero() {
        let (engine, demux) = engine();
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
        engine
            .set(handle, &[0x02, 0x00, 0x01, 0x00], &[0xFF, 0xFF, 0xFF, 0xFF], Comparator::Equal)
            .unwrap();
        assert_eq!(demux.masks.lock()[0], vec![0xFF, 0xFF, 0x00, 0xFF]);

        // Short patterns have no bypass byte to clear
        engine.set(handle, &[0x02, 0x00], &[0xFF, 0xFF], Comparator::Equal).unwrap();
        assert_eq!(demux.masks.lock()[1], vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_state_machine() {
        let (engine, _demux) = engine();
        let log = Log::default();
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();

        assert!(matches!(
            engine.start(handle, StartParams::default(), recording_callbacks(&log)),
            Err(FilterError::WrongState { operation: "start", state: "Open" })
        ));

        engine.set(handle, &[0x00], &[0xFF], Comparator::Equal).unwrap();
        engine.start(handle, StartParams::default(), recording_callbacks(&log)).unwrap();
        assert_eq!(engine.state(handle), Some(FilterState::Running));

        assert!(matches!(
            engine.set(handle, &[0x00], &[0xFF], Comparator::Equal),
            Err(FilterError::WrongState { operation: "set", state: "Running" })
        ));
        assert!(matches!(
            engine.start(handle, StartParams::default(), recording_callbacks(&log)),
            Err(FilterError::WrongState { .. })
        ));

        engine.stop(handle).unwrap();
        engine.set(handle, &[0x02], &[0xFF], Comparator::Equal).unwrap();
        assert_eq!(engine.state(handle), Some(FilterState::Set));
        engine.start(handle, StartParams::default(), recording_callbacks(&log)).unwrap();

        engine.destroy(handle).unwrap();
        assert_eq!(engine.state(handle), None);
        assert_eq!(engine.set(handle, &[0x00], &[0xFF], Comparator::Equal), Err(FilterError::InvalidHandle));
        assert_eq!(engine.stop(handle), Err(FilterError::InvalidHandle));
    }

    #[test]
    fn test_double_stop_is_idempotent() {
        let (engine, demux) = engine();
        let log = Log::default();
        let handle = started(&engine, StartParams::default(), &log);

        engine.stop(handle).unwrap();
        assert_eq!(engine.state(handle), Some(FilterState::Stopped));
        engine.stop(handle).unwrap();
        assert_eq!(engine.state(handle), Some(FilterState::Stopped));

        let stops = demux.calls().iter().filter(|c| c.ends_with("Stop")).count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_destroy_running_filter_stops_first() {
        let (engine, demux) = engine();
        let log = Log::default();
        let handle = started(&engine, StartParams::default(), &log);

        engine.destroy(handle).unwrap();
        let calls = demux.calls();
        assert_eq!(
            &calls[calls.len() - 2..],
            &[format!("{} Stop", handle), format!("{} Close", handle)]
        );
        assert_eq!(engine.destroy(handle), Err(FilterError::InvalidHandle));
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn test_single_delivery_pairs_query_and_section() {
        let (engine, _demux) = engine();
        let log = Log::default();
        let handle = started(&engine, StartParams::default(), &log);
        let section = pat_section(1, &[(1, 0x0065)]);

        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::Delivered);
        engine.destroy(handle).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                Event::Query(section.len()),
                Event::Section(SectionStatus::Ok, section.clone(), section.len()),
            ]
        );
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn test_stop_during_query_drops_delivery() {
        let (engine, _demux) = engine();
        let log = Log::default();
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
        engine.set(handle, &[0x00], &[0xFF], Comparator::Equal).unwrap();

        let stopper = Arc::clone(&engine);
        let section_log = Arc::clone(&log);
        let callbacks = FilterCallbacks::new(
            move |_ctx, handle, n| {
                stopper.stop(handle)?;
                Ok(BytesMut::with_capacity(n))
            },
            move |_ctx, _handle, status, buffer, n| {
                section_log.lock().push(Event::Section(status, buffer.to_vec(), n));
            },
        );
        engine.start(handle, StartParams::default(), callbacks).unwrap();

        let section = pat_section(1, &[(1, 0x0065)]);
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::Tardy);
        assert!(log.lock().is_empty());
        assert_eq!(engine.state(handle), Some(FilterState::Stopped));
        assert_eq!(engine.stats(handle).unwrap().tardy, 1);

        engine.destroy(handle).unwrap();
    }

    #[test]
    fn test_short_buffer_rejected_filter_keeps_running() {
        let (engine, _demux) = engine();
        let log = Log::default();
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
        engine.set(handle, &[0x00], &[0xFF], Comparator::Equal).unwrap();

        let section_log = Arc::clone(&log);
        let callbacks = FilterCallbacks::new(
            |_ctx, _handle, n| Ok(BytesMut::with_capacity(n / 2)),
            move |_ctx, _handle, status, buffer, n| {
                section_log.lock().push(Event::Section(status, buffer.to_vec(), n));
            },
        );
        engine.start(handle, StartParams::default(), callbacks).unwrap();

        let section = pat_section(1, &[(1, 0x0065)]);
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::BufferRejected);
        assert!(log.lock().is_empty());
        assert_eq!(engine.state(handle), Some(FilterState::Running));
        assert_eq!(engine.stats(handle).unwrap().rejected_buffers, 1);
    }

    #[test]
    fn test_failed_buffer_request_rejected() {
        let (engine, _demux) = engine();
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
        engine.set(handle, &[0x00], &[0xFF], Comparator::Equal).unwrap();
        let callbacks = FilterCallbacks::new(
            |_ctx, _handle, _n| Err(FilterError::OutOfMemory),
            |_ctx, _handle, _status, _buffer, _n| panic!("no delivery expected"),
        );
        engine.start(handle, StartParams::default(), callbacks).unwrap();

        let section = pat_section(1, &[]);
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::BufferRejected);
        assert_eq!(engine.state(handle), Some(FilterState::Running));
    }

    #[test]
    fn test_one_shot_stops_after_first_section() {
        let (engine, demux) = engine();
        let log = Log::default();
        let params = StartParams {
            one_shot: true,
            ..Default::default()
        };
        let handle = started(&engine, params, &log);
        let section = pat_section(1, &[(1, 0x0065)]);

        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::Delivered);
        assert_eq!(engine.state(handle), Some(FilterState::Stopped));
        assert!(demux.calls().contains(&format!("{} Stop", handle)));
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::NotRunning);
        assert_eq!(log.lock().len(), 2);

        // Restart re-arms the filter
        engine.start(handle, params, recording_callbacks(&log)).unwrap();
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::Delivered);
    }

    #[test]
    fn test_one_shot_restarted_from_section_callback() {
        let (engine, demux) = engine();
        let log = Log::default();
        let params = StartParams {
            one_shot: true,
            ..Default::default()
        };
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
        engine.set(handle, &[0x00], &[0xFF], Comparator::Equal).unwrap();

        let restarter = Arc::clone(&engine);
        let restart_log = Arc::clone(&log);
        let restarts = Arc::new(Mutex::new(Vec::new()));
        let restart_results = Arc::clone(&restarts);
        let callbacks = FilterCallbacks::new(
            |_ctx, _handle, n| Ok(BytesMut::with_capacity(n)),
            move |_ctx, handle, _status, _buffer, _n| {
                let state = restarter.state(handle);
                let result = restarter.start(handle, params, recording_callbacks(&restart_log));
                restart_results.lock().push((state, result));
            },
        );
        engine.start(handle, params, callbacks).unwrap();

        let section = pat_section(1, &[(1, 0x0065)]);
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::Delivered);
        assert_eq!(*restarts.lock(), vec![(Some(FilterState::Stopped), Ok(()))]);
        assert_eq!(engine.state(handle), Some(FilterState::Running));

        // The demux saw the one-shot stop before the restart
        let calls = demux.calls();
        assert_eq!(
            &calls[calls.len() - 2..],
            &[format!("{} Stop", handle), format!("{} Start", handle)]
        );

        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::Delivered);
        assert_eq!(log.lock().len(), 2);
        assert_eq!(engine.state(handle), Some(FilterState::Stopped));
    }

    #[test]
    fn test_start_and_stop_racing_destroy() {
        let (engine, _demux) = engine();
        let log = Log::default();
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
        engine.set(handle, &[0x00], &[0xFF], Comparator::Equal).unwrap();
        let filter = engine.registry().lookup(handle).unwrap();

        // Hold the control lock so both calls park after their lookup,
        // then close the filter underneath them.
        let control = filter.control.lock();
        let starter = {
            let engine = Arc::clone(&engine);
            let callbacks = recording_callbacks(&log);
            std::thread::spawn(move || engine.start(handle, StartParams::default(), callbacks))
        };
        let stopper = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.stop(handle))
        };
        std::thread::sleep(Duration::from_millis(50));
        engine.registry().remove(handle).unwrap();
        drop(control);

        assert_eq!(starter.join().unwrap(), Err(FilterError::InvalidHandle));
        assert_eq!(stopper.join().unwrap(), Err(FilterError::InvalidHandle));
        assert_eq!(filter.state(), FilterState::Closed);
    }

    #[test]
    fn test_stop_after_demux_detached() {
        let (engine, demux) = engine();
        let log = Log::default();
        let handle = started(&engine, StartParams::default(), &log);
        let calls_before = demux.calls().len();

        engine.detach_demux();
        assert_eq!(engine.stop(handle), Ok(()));
        assert_eq!(engine.state(handle), Some(FilterState::Stopped));
        assert_eq!(demux.calls().len(), calls_before);
    }

    #[test]
    fn test_create_rollback_when_demux_rejects() {
        struct RejectingDemux;

        impl Demux for RejectingDemux {
            fn set_filter_action(&self, _handle: FilterHandle, action: FilterAction) -> Result<(), FilterError> {
                match action {
                    FilterAction::Open => Ok(()),
                    _ => Err(FilterError::failed("demux gone")),
                }
            }

            fn set_filter_pid(&self, _handle: FilterHandle, _pid: u16) -> Result<(), FilterError> {
                Err(FilterError::bad_param("pid not routable"))
            }

            fn set_filter_format(&self, _handle: FilterHandle, _format: FilterFormat) -> Result<(), FilterError> {
                Ok(())
            }

            fn set_filter_value_mask(
                &self,
                _handle: FilterHandle,
                _value: &[u8],
                _mask: &[u8],
                _comparator: Comparator,
            ) -> Result<(), FilterError> {
                Ok(())
            }
        }

        let engine = FilterEngine::new(3, 4096);
        engine.attach_demux(Arc::new(RejectingDemux));
        assert!(matches!(
            engine.create(0x0100, FilterFormat::Section, Arc::new(())),
            Err(FilterError::BadParam(_))
        ));
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn test_crc_check_drops_corrupt_sections() {
        let (engine, _demux) = engine();
        let log = Log::default();
        let params = StartParams {
            enable_crc: true,
            ..Default::default()
        };
        let handle = started(&engine, params, &log);

        let mut section = pat_section(1, &[(1, 0x0065)]);
        let last = section.len() - 1;
        section[last] ^= 0xFF;
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::CrcMismatch);
        assert!(log.lock().is_empty());
        assert_eq!(engine.stats(handle).unwrap().crc_errors, 1);

        section[last] ^= 0xFF;
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::Delivered);
    }

    #[test]
    fn test_oversized_section_dropped() {
        let engine = FilterEngine::new(3, 8);
        engine.attach_demux(Arc::new(RecordingDemux::default()));
        let log = Log::default();
        let handle = started(&engine, StartParams::default(), &log);

        let section = pat_section(1, &[(1, 0x0065)]);
        assert_eq!(engine.deliver(handle, &section), DeliveryOutcome::Oversized);
        assert_eq!(engine.stats(handle).unwrap().oversized, 1);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_deliver_unknown_or_idle() {
        let (engine, _demux) = engine();
        assert_eq!(
            engine.deliver(FilterHandle::new(0, 9), &[0x00]),
            DeliveryOutcome::UnknownHandle
        );
        let handle = engine.create(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
        assert_eq!(engine.deliver(handle, &[0x00]), DeliveryOutcome::NotRunning);
    }

    #[test]
    fn test_owner_context_passed_to_callbacks() {
        let (engine, _demux) = engine();
        let handle = engine
            .create(0x0000, FilterFormat::Section, Arc::new(String::from("pat watcher")))
            .unwrap();
        engine.set(handle, &[0x00], &[0xFF], Comparator::Equal).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_section = Arc::clone(&seen);
        let callbacks = FilterCallbacks::new(
            |ctx, _handle, n| {
                assert_eq!(ctx.downcast_ref::<String>().map(String::as_str), Some("pat watcher"));
                Ok(BytesMut::with_capacity(n))
            },
            move |ctx, handle, _status, _buffer, _n| {
                let owner = ctx.downcast_ref::<String>().cloned().unwrap_or_default();
                seen_section.lock().push((owner, handle));
            },
        );
        engine.start(handle, StartParams::default(), callbacks).unwrap();
        engine.deliver(handle, &pat_section(1, &[]));

        assert_eq!(*seen.lock(), vec![("pat watcher".to_string(), handle)]);
    }

    #[test]
    fn test_timeout_reported_once_per_period() {
        let (engine, _demux) = engine();
        let log = Log::default();
        let params = StartParams {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let handle = started(&engine, params, &log);
        let start = Instant::now();

        assert_eq!(engine.poll_timeouts(start), 0);
        assert_eq!(engine.poll_timeouts(start + Duration::from_millis(150)), 1);
        // Re-armed from the poll that fired
        assert_eq!(engine.poll_timeouts(start + Duration::from_millis(200)), 0);
        assert_eq!(engine.poll_timeouts(start + Duration::from_millis(260)), 1);

        assert_eq!(
            log.lock()[0],
            Event::Section(SectionStatus::Timeout, Vec::new(), 0)
        );
        assert_eq!(engine.stats(handle).unwrap().timeouts, 2);

        engine.stop(handle).unwrap();
        assert_eq!(engine.poll_timeouts(start + Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_close_all() {
        let (engine, _demux) = engine();
        let log = Log::default();
        started(&engine, StartParams::default(), &log);
        engine.create(0x0010, FilterFormat::Section, Arc::new(())).unwrap();

        assert_eq!(engine.close_all(), 2);
        assert_eq!(engine.live_count(), 0);
        assert_eq!(engine.close_all(), 0);
    }
}
