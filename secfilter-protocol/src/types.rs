//! Filter vocabulary shared by the engine and the demultiplexer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// PID value meaning "no PID restriction" (also the null-packet PID).
pub const PID_ANY: u16 = 0x1FFF;

/// Largest valid PID (13 bits).
pub const MAX_PID: u16 = 0x1FFF;

/// Maximum length of a filter value/mask pattern supported by the hardware.
pub const MAX_FILTER_LENGTH: usize = 16;

/// Mask byte that the hardware cannot match on; always written as zero.
pub const MASK_BYPASS_INDEX: usize = 2;

/// Concurrent filter limit of the reference hardware.
pub const DEFAULT_MAX_FILTERS: usize = 3;

/// Opaque filter handle.
///
/// The handle packs a registry slot index with the generation of that slot,
/// so a handle kept after `destroy` never aliases a filter created later in
/// the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterHandle(u64);

impl FilterHandle {
    /// Build a handle from a slot index and generation.
    pub fn new(index: u32, generation: u32) -> Self {
        FilterHandle(((generation as u64) << 32) | index as u64)
    }

    /// Slot index in the registry.
    pub fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw 64-bit value (for logging or foreign callers).
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw value.
    pub fn from_raw(raw: u64) -> Self {
        FilterHandle(raw)
    }
}

impl fmt::Display for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index(), self.generation())
    }
}

/// How the demultiplexer interprets the data of a filtered PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterFormat {
    /// Complete PSI/SI sections (table_id through CRC).
    #[default]
    Section,
    /// Raw 188-byte transport packets of the PID.
    TsPacket,
}

impl FilterFormat {
    /// Short name used in logs and element properties.
    pub fn name(self) -> &'static str {
        match self {
            FilterFormat::Section => "section",
            FilterFormat::TsPacket => "ts-packet",
        }
    }
}

/// Comparison applied to the masked filter bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// Every masked bit must equal the value.
    #[default]
    Equal,
    /// At least one masked bit must differ from the value.
    NotEqual,
}

/// Filter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FilterState {
    /// Allocated, not configured yet.
    Open = 0,
    /// Pattern configured, never started.
    Set = 1,
    /// Delivering sections.
    Running = 2,
    /// Stopped, may be restarted.
    Stopped = 3,
    /// Destroyed; terminal.
    Closed = 4,
}

impl FilterState {
    /// Decode a state stored as a raw byte.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => FilterState::Open,
            1 => FilterState::Set,
            2 => FilterState::Running,
            3 => FilterState::Stopped,
            _ => FilterState::Closed,
        }
    }

    /// Whether `start` is valid in this state.
    pub fn can_start(self) -> bool {
        matches!(self, FilterState::Set | FilterState::Stopped)
    }

    /// Whether `set_filter` is valid in this state.
    pub fn can_configure(self) -> bool {
        matches!(
            self,
            FilterState::Open | FilterState::Set | FilterState::Stopped
        )
    }

    /// State name for logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            FilterState::Open => "Open",
            FilterState::Set => "Set",
            FilterState::Running => "Running",
            FilterState::Stopped => "Stopped",
            FilterState::Closed => "Closed",
        }
    }
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Filter action written to the demultiplexer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterAction {
    Open,
    Set,
    Start,
    Stop,
    Close,
}

/// Status passed with each `on_section` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionStatus {
    /// A matching section was delivered.
    Ok,
    /// No section arrived within the filter timeout.
    Timeout,
}
