//! MPEG-2 PSI decoding for section filters.
//!
//! This crate turns raw section bytes, as delivered by a section filter, into
//! structured tables, and provides the transport-packet plumbing a software
//! demultiplexer needs to assemble those sections.
//!
//! # Supported Tables
//! - PAT (Program Association Table) - PID 0x0000
//! - PMT (Program Map Table) - PIDs listed in the PAT
//!
//! # Usage
//! ```
//! use secfilter_psi::parse_pat;
//!
//! let section = [
//!     0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, // header
//!     0x00, 0x01, 0xE0, 0x65,                         // program 1 -> PID 0x0065
//!     0x81, 0x80, 0x32, 0x5D,                         // CRC32
//! ];
//! let pat = parse_pat(&section).unwrap();
//! assert_eq!(pat.entries.len(), 1);
//! assert_eq!(pat.pmt_pid(1), Some(0x0065));
//! assert!(pat.crc_ok());
//! ```

mod descriptors;
mod error;
mod packet;
mod pat;
mod pmt;
mod psi;
mod reader;

pub use descriptors::{
    CaptionService, CaptionServiceDescriptor, Descriptor, Iso639Language,
    Iso639LanguageDescriptor,
};
pub use error::ParseError;
pub use packet::{AdaptationField, TsHeader, TsPacket, TsPacketIterator, SYNC_BYTE, TS_PACKET_SIZE};
pub use pat::{parse_pat, PatEntry, PatTable, MAX_PAT_PROGRAMS};
pub use pmt::{parse_pmt, stream_type, PmtTable, Program, MAX_PMT_STREAMS};
pub use psi::{crc32_mpeg2, section_crc_ok, PsiHeader, PsiSection, SectionCollector};

/// Well-known PIDs in MPEG-TS.
pub mod pid {
    /// Program Association Table PID.
    pub const PAT: u16 = 0x0000;
    /// Conditional Access Table PID.
    pub const CAT: u16 = 0x0001;
    /// Transport Stream Description Table PID.
    pub const TSDT: u16 = 0x0002;
    /// Null packet PID (stuffing).
    pub const NULL: u16 = 0x1FFF;
}

/// Table IDs for PSI tables.
pub mod table_id {
    /// Program Association Section.
    pub const PAT: u8 = 0x00;
    /// Conditional Access Section.
    pub const CAT: u8 = 0x01;
    /// Program Map Section.
    pub const PMT: u8 = 0x02;
    /// Stuffing byte that terminates the sections of a packet.
    pub const STUFFING: u8 = 0xFF;
}

/// Descriptor tags decoded by this crate.
pub mod descriptor_tag {
    /// ISO 639 language descriptor.
    pub const ISO_639_LANGUAGE: u8 = 0x0A;
    /// ATSC caption service descriptor.
    pub const CAPTION_SERVICE: u8 = 0x86;
}
