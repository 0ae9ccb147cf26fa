//! Demultiplexer boundary.
//!
//! The filter engine never parses transport streams itself. It drives a
//! [`Demux`] through four element controls and receives filtered buffers
//! through a [`DemuxEventSender`], which queues them for the session's
//! dispatch thread.

mod software;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use secfilter_protocol::{Comparator, FilterAction, FilterError, FilterFormat, FilterHandle};

pub use software::SoftwareDemux;

/// Element controls the filter engine needs from a demultiplexer.
///
/// Implementations are shared between the consumer thread (filter API
/// calls) and the dispatch thread (one-shot auto-stop), so every method
/// takes `&self`.
pub trait Demux: Send + Sync {
    /// Open, set, start, stop or close the hardware filter behind `handle`.
    fn set_filter_action(&self, handle: FilterHandle, action: FilterAction) -> Result<(), FilterError>;

    /// Select the PID the filter listens on.
    fn set_filter_pid(&self, handle: FilterHandle, pid: u16) -> Result<(), FilterError>;

    /// Select whether the filter emits sections or raw TS packets.
    fn set_filter_format(&self, handle: FilterHandle, format: FilterFormat) -> Result<(), FilterError>;

    /// Program the value/mask pattern. The mask arrives with the bypass byte
    /// already cleared.
    fn set_filter_value_mask(
        &self,
        handle: FilterHandle,
        value: &[u8],
        mask: &[u8],
        comparator: Comparator,
    ) -> Result<(), FilterError>;
}

/// Commands consumed by the session's dispatch thread.
#[derive(Debug)]
pub enum DispatchCommand {
    /// A filtered buffer is available for `handle`.
    Section { handle: FilterHandle, data: Bytes },
    /// Stop the dispatch thread.
    Shutdown,
}

/// Producer side of the dispatch queue.
///
/// Cloned into every demultiplexer that feeds a session. Sending never
/// blocks: when the queue is full the buffer is dropped and counted.
#[derive(Clone)]
pub struct DemuxEventSender {
    tx: SyncSender<DispatchCommand>,
    dropped: Arc<AtomicU64>,
}

impl DemuxEventSender {
    /// Create a bounded dispatch queue.
    pub fn channel(depth: usize) -> (Self, Receiver<DispatchCommand>) {
        let (tx, rx) = mpsc::sync_channel(depth);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Report a filtered buffer (`on_buffer_available`).
    ///
    /// Returns false when the buffer was dropped.
    pub fn buffer_available(&self, handle: FilterHandle, data: Bytes) -> bool {
        match self.tx.try_send(DispatchCommand::Section { handle, data }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("[Demux] Dispatch queue full, {} buffer(s) dropped so far", dropped);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Number of buffers dropped because the dispatch queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wake the dispatch thread with a shutdown request. Never blocks; a full
    /// queue already keeps the thread awake. False once the thread is gone.
    pub(crate) fn shutdown(&self) -> bool {
        !matches!(
            self.tx.try_send(DispatchCommand::Shutdown),
            Err(TrySendError::Disconnected(_))
        )
    }
}
