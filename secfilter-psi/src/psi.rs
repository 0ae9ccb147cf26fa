//! PSI (Program Specific Information) section parsing.
//!
//! This module handles the common section header, CRC validation and the
//! assembly of sections that span several transport packets.

use crc::{Crc, CRC_32_MPEG_2};
use log::trace;
use serde::Serialize;

use crate::error::ParseError;
use crate::reader::ByteReader;
use crate::table_id;

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Length of table_id + flags + section_length.
pub(crate) const SHORT_HEADER_LEN: usize = 3;
/// Length of the long-form header up to and including last_section_number.
pub(crate) const LONG_HEADER_LEN: usize = 8;
/// Length of the trailing CRC32.
pub(crate) const CRC_LEN: usize = 4;
/// Largest value the 12-bit section_length field can carry.
const MAX_SECTION_LENGTH: usize = 0x0FFF;

/// PSI section header (common to all PSI tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PsiHeader {
    /// Table ID.
    pub table_id: u8,
    /// Section syntax indicator.
    pub section_syntax_indicator: bool,
    /// Private indicator ('0' bit in PAT/PMT).
    pub private_indicator: bool,
    /// Two reserved bits following the private indicator.
    pub reserved: u8,
    /// Section length (12 bits).
    pub section_length: u16,
    /// Table ID extension (transport_stream_id for PAT, program_number for PMT).
    pub table_id_extension: u16,
    /// Two reserved bits preceding the version number.
    pub reserved_ext: u8,
    /// Version number (5 bits).
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

/// A parsed PSI section.
#[derive(Debug, Clone)]
pub struct PsiSection<'a> {
    /// Section header.
    pub header: PsiHeader,
    /// Section data (after header, before CRC).
    pub data: &'a [u8],
    /// CRC32 value as transmitted.
    pub crc32: u32,
    /// Bytes covered by the CRC (table_id up to, excluding, the CRC field).
    covered: &'a [u8],
}

impl<'a> PsiSection<'a> {
    /// Parse a long-form section from raw bytes starting at table_id.
    ///
    /// Bytes after the declared section end are ignored. A declared length
    /// that runs past the buffer is reported as [`ParseError::TooShort`].
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        let mut reader = ByteReader::new(data);

        let table_id = reader.u8()?;
        let flags = reader.u16()?;
        let section_syntax_indicator = flags & 0x8000 != 0;
        let private_indicator = flags & 0x4000 != 0;
        let reserved = ((flags >> 12) & 0x03) as u8;
        let section_length = flags & 0x0FFF;

        if !section_syntax_indicator {
            return Err(ParseError::ShortForm(table_id));
        }

        let table_id_extension = reader.u16()?;
        let version_byte = reader.u8()?;
        let section_number = reader.u8()?;
        let last_section_number = reader.u8()?;

        let declared = section_length as usize;
        if declared < LONG_HEADER_LEN - SHORT_HEADER_LEN + CRC_LEN {
            return Err(ParseError::InvalidLength(section_length));
        }

        let total_length = SHORT_HEADER_LEN + declared;
        if data.len() < total_length {
            return Err(ParseError::too_short(total_length, data.len()));
        }

        let header = PsiHeader {
            table_id,
            section_syntax_indicator,
            private_indicator,
            reserved,
            section_length,
            table_id_extension,
            reserved_ext: version_byte >> 6,
            version_number: (version_byte >> 1) & 0x1F,
            current_next_indicator: version_byte & 0x01 != 0,
            section_number,
            last_section_number,
        };

        let crc_offset = total_length - CRC_LEN;
        let crc32 = ByteReader::new(&data[crc_offset..total_length]).u32()?;

        Ok(PsiSection {
            header,
            data: &data[LONG_HEADER_LEN..crc_offset],
            crc32,
            covered: &data[..crc_offset],
        })
    }

    /// Verify the CRC32 of the section.
    pub fn verify_crc(&self) -> bool {
        crc32_mpeg2(self.covered) == self.crc32
    }

    /// Get the total section length including header and CRC.
    pub fn total_length(&self) -> usize {
        SHORT_HEADER_LEN + self.header.section_length as usize
    }

    /// Reject sections that do not carry the expected table.
    pub(crate) fn expect_table(&self, expected: u8) -> Result<(), ParseError> {
        if self.header.table_id != expected {
            return Err(ParseError::UnexpectedTableId {
                expected,
                found: self.header.table_id,
            });
        }
        Ok(())
    }
}

/// Calculate CRC32 for MPEG-2 (polynomial 0x04C11DB7).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    CRC_MPEG.checksum(data)
}

/// Check the CRC of a complete section (table_id through CRC32).
///
/// Returns false when the buffer is shorter than the declared section.
pub fn section_crc_ok(section: &[u8]) -> bool {
    if section.len() < SHORT_HEADER_LEN {
        return false;
    }
    let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    let total_length = SHORT_HEADER_LEN + section_length;
    if section_length < CRC_LEN || section.len() < total_length {
        return false;
    }
    // Running the CRC over the CRC field itself yields zero for intact data.
    crc32_mpeg2(&section[..total_length]) == 0
}

/// Section collector for multi-packet sections on one PID.
#[derive(Debug, Default)]
pub struct SectionCollector {
    /// Buffer for collecting section data.
    buffer: Vec<u8>,
    /// Last continuity counter.
    last_cc: Option<u8>,
    /// Number of partial sections discarded after a discontinuity.
    discontinuities: u64,
}

impl SectionCollector {
    /// Create a new section collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the collector.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_cc = None;
    }

    /// Check if collector holds a partial section.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Partial sections dropped because of continuity errors.
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Add the payload of one TS packet.
    ///
    /// Returns every section completed by this payload, in stream order.
    /// `discontinuity` is the adaptation-field discontinuity indicator; when
    /// set, a continuity-counter jump is accepted without dropping data.
    pub fn add_data(
        &mut self,
        payload: &[u8],
        cc: u8,
        payload_unit_start: bool,
        discontinuity: bool,
    ) -> Vec<Vec<u8>> {
        let mut sections = Vec::new();

        if let Some(last) = self.last_cc {
            if cc == last && !payload_unit_start {
                // Duplicate packet
                return sections;
            }
            if cc != (last + 1) & 0x0F && !discontinuity && !self.buffer.is_empty() {
                trace!("Continuity error (expected {}, got {}), dropping partial section", (last + 1) & 0x0F, cc);
                self.buffer.clear();
                self.discontinuities += 1;
            }
        }
        self.last_cc = Some(cc);

        if payload.is_empty() {
            return sections;
        }

        if payload_unit_start {
            let pointer = payload[0] as usize;
            let section_start = 1 + pointer;
            if section_start > payload.len() {
                self.buffer.clear();
                return sections;
            }

            // Bytes before the pointer target finish the previous section.
            if !self.buffer.is_empty() {
                self.buffer.extend_from_slice(&payload[1..section_start]);
                self.drain_complete(&mut sections);
                if !self.buffer.is_empty() {
                    self.buffer.clear();
                    self.discontinuities += 1;
                }
            }

            self.buffer.extend_from_slice(&payload[section_start..]);
        } else if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(payload);
        }

        self.drain_complete(&mut sections);
        sections
    }

    /// Move every complete section out of the buffer.
    fn drain_complete(&mut self, sections: &mut Vec<Vec<u8>>) {
        while !self.buffer.is_empty() {
            if self.buffer[0] == table_id::STUFFING {
                self.buffer.clear();
                break;
            }
            if self.buffer.len() < SHORT_HEADER_LEN {
                break;
            }

            let section_length =
                (((self.buffer[1] & 0x0F) as usize) << 8) | self.buffer[2] as usize;
            let total_length = SHORT_HEADER_LEN + section_length.min(MAX_SECTION_LENGTH);
            if self.buffer.len() < total_length {
                break;
            }

            let rest = self.buffer.split_off(total_length);
            sections.push(std::mem::replace(&mut self.buffer, rest));
        }
    }
}
