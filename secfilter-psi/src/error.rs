//! Error types for PSI decoding.

use thiserror::Error;

/// Errors produced while decoding sections and transport packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer ends before a field that must be read.
    #[error("Buffer too short: need {needed} bytes, have {available}")]
    TooShort { needed: usize, available: usize },

    /// The section carries a different table.
    #[error("Unexpected table_id: expected 0x{expected:02X}, got 0x{found:02X}")]
    UnexpectedTableId { expected: u8, found: u8 },

    /// The section_syntax_indicator is clear where a long-form section is required.
    #[error("Section syntax indicator not set for table 0x{0:02X}")]
    ShortForm(u8),

    /// Declared section length is inconsistent with the table syntax.
    #[error("Invalid section length: {0}")]
    InvalidLength(u16),

    /// Declared entry count exceeds the fixed storage limit.
    #[error("Too many entries: {count} (max: {max})")]
    TooManyEntries { count: usize, max: usize },

    /// A descriptor's declared length runs past the end of its loop.
    #[error("Descriptor 0x{tag:02X} overruns its loop: length {length}, remaining {remaining}")]
    DescriptorOverrun {
        tag: u8,
        length: usize,
        remaining: usize,
    },

    /// Transport packet does not start with 0x47.
    #[error("Invalid sync byte: 0x{0:02X}")]
    InvalidSyncByte(u8),
}

impl ParseError {
    pub(crate) fn too_short(needed: usize, available: usize) -> Self {
        ParseError::TooShort { needed, available }
    }
}
