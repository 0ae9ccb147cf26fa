//! Shared vocabulary for the MPEG-TS section-filter subsystem.
//!
//! This crate defines the types exchanged between the filter engine, the
//! demultiplexer that feeds it and the application that owns the filters.
//!
//! # Filter lifecycle
//!
//! ```text
//!  create        set_filter        start
//! -------> Open -----------> Set ---------> Running
//!                                  ^          |
//!                            start |          | stop / one-shot delivery
//!                                  |          v
//!                                  +------ Stopped
//!
//!  destroy (from any state) -> Closed
//! ```
//!
//! # Example
//!
//! ```rust
//! use secfilter_protocol::{FilterError, FilterHandle, FilterState, ResultCode};
//!
//! let handle = FilterHandle::new(0, 1);
//! assert_eq!(handle.index(), 0);
//! assert_eq!(handle.generation(), 1);
//!
//! assert!(FilterState::Stopped.can_start());
//! assert!(!FilterState::Closed.can_start());
//!
//! let err = FilterError::OutOfHandles { max: 3 };
//! assert_eq!(err.code(), ResultCode::OutOfHandles);
//! ```

pub mod error;
pub mod types;

pub use error::{FilterError, ResultCode};
pub use types::{
    Comparator, FilterAction, FilterFormat, FilterHandle, FilterState, SectionStatus,
    DEFAULT_MAX_FILTERS, MASK_BYPASS_INDEX, MAX_FILTER_LENGTH, MAX_PID, PID_ANY,
};
