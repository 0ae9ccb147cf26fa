//! PID/section filter engine for MPEG-TS demultiplexers.
//!
//! A [`Session`] owns up to `max_filters` section filters. Each filter is
//! configured on a [`Demux`] (PID, format, value/mask pattern) and, once
//! started, receives every matching section through a two-phase exchange:
//! the client first supplies a buffer (`on_buffer_needed`), then receives
//! it back filled (`on_section`). Callbacks run on the session's dispatch
//! thread.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::BytesMut;
//! use secfilter::{FilterCallbacks, Session, SessionConfig, SoftwareDemux, StartParams};
//! use secfilter_protocol::{Comparator, FilterFormat};
//!
//! let session = Session::open(SessionConfig::default()).unwrap();
//! let demux = Arc::new(SoftwareDemux::new(session.event_sender()));
//! session.on_demux_ready(demux.clone()).unwrap();
//!
//! let pat = session.create_filter(0x0000, FilterFormat::Section, Arc::new(())).unwrap();
//! session.set_filter(pat, &[0x00], &[0xFF], Comparator::Equal).unwrap();
//! session
//!     .start_filter(
//!         pat,
//!         StartParams { one_shot: true, ..Default::default() },
//!         FilterCallbacks::new(
//!             |_ctx, _handle, n| Ok(BytesMut::with_capacity(n)),
//!             |_ctx, _handle, _status, section, _n| {
//!                 println!("{}", secfilter_psi::parse_pat(&section).unwrap());
//!             },
//!         ),
//!     )
//!     .unwrap();
//!
//! demux.feed(&std::fs::read("capture.ts").unwrap());
//! ```

pub mod demux;
pub mod filter;
pub mod session;

#[cfg(test)]
mod test_support;

pub use demux::{Demux, DemuxEventSender, DispatchCommand, SoftwareDemux};
pub use filter::{
    DeliveryOutcome, Filter, FilterCallbacks, FilterEngine, FilterRegistry, FilterStats,
    OwnerContext, StartParams,
};
pub use session::{Session, SessionConfig};
