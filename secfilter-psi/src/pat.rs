//! PAT (Program Association Table) parsing.
//!
//! The PAT is transmitted on PID 0x0000 and contains a list of programs
//! with their PMT PIDs.

use std::fmt;

use serde::Serialize;

use crate::error::ParseError;
use crate::psi::{PsiHeader, PsiSection, CRC_LEN, LONG_HEADER_LEN, SHORT_HEADER_LEN};
use crate::reader::ByteReader;
use crate::table_id;

/// Maximum number of program entries accepted in one PAT section.
pub const MAX_PAT_PROGRAMS: usize = 20;

/// Size of one program entry.
const ENTRY_LEN: usize = 4;

/// A single PAT entry (program number and PMT PID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PatEntry {
    /// Program number (0 = network PID, others = program).
    pub program_number: u16,
    /// Three reserved bits preceding the PID.
    pub reserved: u8,
    /// PID of the PMT for this program (or the network PID if program_number = 0).
    pub program_map_pid: u16,
}

/// Parsed PAT (Program Association Table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatTable {
    /// Section header.
    pub header: PsiHeader,
    /// Program entries in transmission order.
    pub entries: Vec<PatEntry>,
    /// CRC32 as transmitted.
    pub crc32: u32,
    #[serde(skip)]
    crc_valid: bool,
}

/// Parse a PAT section starting at table_id.
pub fn parse_pat(data: &[u8]) -> Result<PatTable, ParseError> {
    let section = PsiSection::parse(data)?;
    PatTable::from_section(&section)
}

impl PatTable {
    /// Build a PAT from an already parsed PSI section.
    pub fn from_section(section: &PsiSection) -> Result<Self, ParseError> {
        section.expect_table(table_id::PAT)?;

        let section_length = section.header.section_length;
        let loop_length =
            section_length as usize + SHORT_HEADER_LEN - LONG_HEADER_LEN - CRC_LEN;
        if loop_length % ENTRY_LEN != 0 {
            return Err(ParseError::InvalidLength(section_length));
        }

        let count = loop_length / ENTRY_LEN;
        if count > MAX_PAT_PROGRAMS {
            return Err(ParseError::TooManyEntries {
                count,
                max: MAX_PAT_PROGRAMS,
            });
        }

        let mut reader = ByteReader::new(section.data);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let program_number = reader.u16()?;
            let pid_field = reader.u16()?;
            entries.push(PatEntry {
                program_number,
                reserved: (pid_field >> 13) as u8,
                program_map_pid: pid_field & 0x1FFF,
            });
        }

        Ok(PatTable {
            header: section.header,
            entries,
            crc32: section.crc32,
            crc_valid: section.verify_crc(),
        })
    }

    /// Transport stream ID.
    pub fn transport_stream_id(&self) -> u16 {
        self.header.table_id_extension
    }

    /// Whether the transmitted CRC matched the section contents.
    pub fn crc_ok(&self) -> bool {
        self.crc_valid
    }

    /// Get PMT PID for a specific program number.
    pub fn pmt_pid(&self, program_number: u16) -> Option<u16> {
        self.programs()
            .find(|e| e.program_number == program_number)
            .map(|e| e.program_map_pid)
    }

    /// Network PID (entry with program number 0), if present.
    pub fn network_pid(&self) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.program_number == 0)
            .map(|e| e.program_map_pid)
    }

    /// Program entries, excluding the network PID entry.
    pub fn programs(&self) -> impl Iterator<Item = &PatEntry> {
        self.entries.iter().filter(|e| e.program_number != 0)
    }
}

impl fmt::Display for PatTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(
            f,
            "PAT: table_id=0x{:02X} section_length={} transport_stream_id=0x{:04X} version={} current_next={} section={}/{}",
            h.table_id,
            h.section_length,
            h.table_id_extension,
            h.version_number,
            h.current_next_indicator as u8,
            h.section_number,
            h.last_section_number
        )?;
        for entry in &self.entries {
            if entry.program_number == 0 {
                writeln!(f, "  network PID 0x{:04X}", entry.program_map_pid)?;
            } else {
                writeln!(
                    f,
                    "  program {:5} (0x{:04X}) -> PMT PID 0x{:04X}",
                    entry.program_number, entry.program_number, entry.program_map_pid
                )?;
            }
        }
        write!(
            f,
            "  CRC32: 0x{:08X}{}",
            self.crc32,
            if self.crc_valid { "" } else { " (mismatch)" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 17-byte buffer: one section (table_id 0, section_length 0x0D) plus a stuffing byte.
    const SAMPLE_PAT: [u8; 17] = [
        0x00, 0x80, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xE0, 0x65, 0x2A, 0xB1,
        0x04, 0xB2, 0xFF,
    ];

    #[test]
    fn test_parse_single_program() {
        let pat = parse_pat(&SAMPLE_PAT).unwrap();

        assert_eq!(pat.entries.len(), 1);
        assert_eq!(pat.entries[0].program_number, 1);
        assert_eq!(pat.entries[0].program_map_pid, 0x0065);
        assert_eq!(pat.entries[0].reserved, 0x07);
        assert_eq!(pat.transport_stream_id(), 0x0001);
        assert_eq!(pat.header.reserved, 0x00);
        assert_eq!(pat.crc32, 0x2AB104B2);
        // The transmitted CRC does not match this header layout
        assert!(!pat.crc_ok());
    }

    #[test]
    fn test_truncated_pat_is_too_short() {
        for n in 0..16 {
            assert!(
                matches!(parse_pat(&SAMPLE_PAT[..n]), Err(ParseError::TooShort { .. })),
                "n = {}",
                n
            );
        }
    }

    #[test]
    fn test_pat_with_network_pid() {
        let data = [
            0x00, 0xB0, 0x11, 0x12, 0x34, 0xC3, 0x00, 0x00,
            // NIT: number=0x0000, PID=0x0010
            0x00, 0x00, 0xE0, 0x10,
            // Program 1: number=0x0101, PID=0x0100
            0x01, 0x01, 0xE1, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];

        let pat = parse_pat(&data).unwrap();
        assert_eq!(pat.header.version_number, 1);
        assert_eq!(pat.entries.len(), 2);
        assert_eq!(pat.network_pid(), Some(0x0010));
        assert_eq!(pat.programs().count(), 1);
        assert_eq!(pat.pmt_pid(0x0101), Some(0x0100));
        assert_eq!(pat.pmt_pid(0), None);
    }

    #[test]
    fn test_entry_count_matches_section_length() {
        // section_length 0x15 = 5 + 3*4 + 4
        let mut data = vec![0x00, 0xB0, 0x15, 0x00, 0x01, 0xC1, 0x00, 0x00];
        for program in 1..=3u8 {
            data.extend_from_slice(&[0x00, program, 0xE1, program]);
        }
        data.extend_from_slice(&[0, 0, 0, 0]);

        let pat = parse_pat(&data).unwrap();
        let section_length = pat.header.section_length as usize;
        assert_eq!(pat.entries.len(), (section_length - 5 - 4) / 4);
    }

    #[test]
    fn test_declared_length_beyond_buffer() {
        // Claims two programs but the buffer stops after one
        let data = [
            0x00, 0xB0, 0x11, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xE0, 0x65, 0x00, 0x00,
            0x00, 0x00,
        ];
        assert_eq!(
            parse_pat(&data).unwrap_err(),
            ParseError::TooShort {
                needed: 20,
                available: 16
            }
        );
    }

    #[test]
    fn test_misaligned_loop() {
        let data = [
            0x00, 0xB0, 0x0E, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xE0, 0x65, 0x00, 0x00,
            0x00, 0x00, 0x00,
        ];
        assert_eq!(parse_pat(&data).unwrap_err(), ParseError::InvalidLength(0x0E));
    }

    #[test]
    fn test_too_many_programs() {
        let count = MAX_PAT_PROGRAMS + 1;
        let section_length = (5 + count * 4 + 4) as u16;
        let mut data = vec![
            0x00,
            0xB0 | (section_length >> 8) as u8,
            section_length as u8,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
        ];
        data.resize(3 + section_length as usize, 0);

        assert_eq!(
            parse_pat(&data).unwrap_err(),
            ParseError::TooManyEntries {
                count,
                max: MAX_PAT_PROGRAMS
            }
        );
    }

    #[test]
    fn test_wrong_table_id() {
        let mut data = SAMPLE_PAT;
        data[0] = 0x02;
        assert_eq!(
            parse_pat(&data).unwrap_err(),
            ParseError::UnexpectedTableId {
                expected: 0x00,
                found: 0x02
            }
        );
    }

    #[test]
    fn test_display() {
        let pat = parse_pat(&SAMPLE_PAT).unwrap();
        let text = pat.to_string();
        assert!(text.starts_with("PAT: table_id=0x00 section_length=13"));
        assert!(text.contains("program     1 (0x0001) -> PMT PID 0x0065"));
        assert!(text.ends_with("CRC32: 0x2AB104B2 (mismatch)"));
    }
}
