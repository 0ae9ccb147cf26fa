//! Filter session: owns the filters, the demux reference and the dispatch
//! thread in which every client callback runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use secfilter_protocol::{
    Comparator, FilterError, FilterFormat, FilterHandle, FilterState, DEFAULT_MAX_FILTERS,
};
use serde::Deserialize;

use crate::demux::{Demux, DemuxEventSender, DispatchCommand};
use crate::filter::{FilterCallbacks, FilterEngine, FilterStats, OwnerContext, StartParams};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrent filters.
    pub max_filters: usize,
    /// Buffers queued between the demux and the dispatch thread.
    pub dispatch_queue_depth: usize,
    /// How often the dispatch thread checks filter timeouts.
    pub timeout_poll_interval_ms: u64,
    /// Largest section handed to a client.
    pub max_section_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_filters: DEFAULT_MAX_FILTERS,
            dispatch_queue_depth: 256,
            timeout_poll_interval_ms: 50,
            max_section_size: 4096,
        }
    }
}

/// A filter session.
pub struct Session {
    id: u64,
    engine: Arc<FilterEngine>,
    events: DemuxEventSender,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    dispatch_thread: ThreadId,
    stopping: Arc<AtomicBool>,
    open: AtomicBool,
}

impl Session {
    /// Create a session and spawn its dispatch thread.
    pub fn open(config: SessionConfig) -> Result<Self, FilterError> {
        if config.max_filters == 0 || config.dispatch_queue_depth == 0 {
            return Err(FilterError::bad_param(
                "max_filters and dispatch_queue_depth must be non-zero",
            ));
        }

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::new(FilterEngine::new(config.max_filters, config.max_section_size));
        let (events, rx) = DemuxEventSender::channel(config.dispatch_queue_depth);
        let poll_interval = Duration::from_millis(config.timeout_poll_interval_ms.max(1));

        let stopping = Arc::new(AtomicBool::new(false));

        let thread_engine = Arc::clone(&engine);
        let thread_stopping = Arc::clone(&stopping);
        let dispatch = thread::Builder::new()
            .name(format!("secfilter-dispatch-{}", id))
            .spawn(move || run_dispatch(id, thread_engine, rx, thread_stopping, poll_interval))
            .map_err(|e| FilterError::failed(format!("spawn dispatch thread: {}", e)))?;
        let dispatch_thread = dispatch.thread().id();

        info!("[Session {}] Opened ({:?})", id, config);
        Ok(Self {
            id,
            engine,
            events,
            dispatch: Mutex::new(Some(dispatch)),
            dispatch_thread,
            stopping,
            open: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), FilterError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FilterError::InvalidHandle)
        }
    }

    /// Sender a demultiplexer uses to report filtered buffers.
    pub fn event_sender(&self) -> DemuxEventSender {
        self.events.clone()
    }

    /// The engine behind this session, e.g. for a producer that calls
    /// [`FilterEngine::deliver`] directly or a callback that stops its filter.
    pub fn engine(&self) -> Arc<FilterEngine> {
        Arc::clone(&self.engine)
    }

    /// The demultiplexer became available.
    pub fn on_demux_ready(&self, demux: Arc<dyn Demux>) -> Result<(), FilterError> {
        self.ensure_open()?;
        self.engine.attach_demux(demux);
        info!("[Session {}] Demux ready", self.id);
        Ok(())
    }

    pub fn create_filter(
        &self,
        pid: u16,
        format: FilterFormat,
        owner_context: OwnerContext,
    ) -> Result<FilterHandle, FilterError> {
        self.ensure_open()?;
        self.engine.create(pid, format, owner_context)
    }

    pub fn set_filter(
        &self,
        handle: FilterHandle,
        value: &[u8],
        mask: &[u8],
        comparator: Comparator,
    ) -> Result<(), FilterError> {
        self.ensure_open()?;
        self.engine.set(handle, value, mask, comparator)
    }

    pub fn start_filter(
        &self,
        handle: FilterHandle,
        params: StartParams,
        callbacks: FilterCallbacks,
    ) -> Result<(), FilterError> {
        self.ensure_open()?;
        self.engine.start(handle, params, callbacks)
    }

    pub fn stop_filter(&self, handle: FilterHandle) -> Result<(), FilterError> {
        self.ensure_open()?;
        self.engine.stop(handle)
    }

    pub fn destroy_filter(&self, handle: FilterHandle) -> Result<(), FilterError> {
        self.ensure_open()?;
        self.engine.destroy(handle)
    }

    pub fn filter_state(&self, handle: FilterHandle) -> Option<FilterState> {
        self.engine.state(handle)
    }

    pub fn filter_stats(&self, handle: FilterHandle) -> Option<FilterStats> {
        self.engine.stats(handle)
    }

    pub fn live_filters(&self) -> usize {
        self.engine.live_count()
    }

    /// Buffers the demux had to drop because the dispatch queue was full.
    pub fn dropped_buffers(&self) -> u64 {
        self.events.dropped()
    }

    /// Close every filter, release the demux and stop the dispatch thread.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("[Session {}] Closing...", self.id);

        let closed = self.engine.close_all();
        self.engine.detach_demux();

        // The flag ends the loop even when the wake-up cannot be queued,
        // e.g. when a callback closes the session while the queue is full.
        self.stopping.store(true, Ordering::Release);
        if !self.events.shutdown() {
            warn!("[Session {}] Dispatch thread already gone", self.id);
        }
        let Some(handle) = self.dispatch.lock().take() else {
            return;
        };
        if thread::current().id() == self.dispatch_thread {
            // Closed from inside a callback; the thread exits on its own.
            debug!("[Session {}] Close requested from dispatch thread", self.id);
        } else if handle.join().is_err() {
            error!("[Session {}] Dispatch thread panicked", self.id);
        }

        info!("[Session {}] Closed ({} filter(s) released)", self.id, closed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
        debug!("[Session {}] Session dropped", self.id);
    }
}

fn run_dispatch(
    id: u64,
    engine: Arc<FilterEngine>,
    rx: Receiver<DispatchCommand>,
    stopping: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    debug!("[Session {}] Dispatch thread started", id);
    while !stopping.load(Ordering::Acquire) {
        let command = match rx.recv_timeout(poll_interval) {
            Ok(DispatchCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
        };

        // A panicking callback must not take the other filters down with it.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if let Some(DispatchCommand::Section { handle, data }) = &command {
                engine.deliver(*handle, data);
            }
            engine.poll_timeouts(Instant::now());
        }));
        if let Err(panic_err) = result {
            error!("[Session {}] Panic in filter callback: {:?}", id, panic_err);
        }
    }
    debug!("[Session {}] Dispatch thread stopped", id);
}
