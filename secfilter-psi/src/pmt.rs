//! PMT (Program Map Table) parsing.
//!
//! The PMT contains information about a specific program,
//! including the PIDs of its elementary streams (video, audio, etc.).

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::descriptors::Descriptor;
use crate::error::ParseError;
use crate::psi::{PsiHeader, PsiSection};
use crate::reader::ByteReader;
use crate::table_id;

/// Maximum number of elementary streams accepted in one PMT section.
pub const MAX_PMT_STREAMS: usize = 50;

/// Stream type constants.
pub mod stream_type {
    /// MPEG-1 Video.
    pub const MPEG1_VIDEO: u8 = 0x01;
    /// MPEG-2 Video.
    pub const MPEG2_VIDEO: u8 = 0x02;
    /// MPEG-1 Audio.
    pub const MPEG1_AUDIO: u8 = 0x03;
    /// MPEG-2 Audio.
    pub const MPEG2_AUDIO: u8 = 0x04;
    /// MPEG-2 Private Sections.
    pub const PRIVATE_SECTIONS: u8 = 0x05;
    /// MPEG-2 PES Private Data.
    pub const PES_PRIVATE_DATA: u8 = 0x06;
    /// AAC Audio (ADTS).
    pub const AAC_AUDIO: u8 = 0x0F;
    /// AAC Audio (LATM).
    pub const AAC_LATM: u8 = 0x11;
    /// MPEG-4 Video (H.264/AVC).
    pub const H264_VIDEO: u8 = 0x1B;
    /// HEVC Video (H.265).
    pub const H265_VIDEO: u8 = 0x24;
    /// AC-3 Audio (ATSC).
    pub const AC3_AUDIO: u8 = 0x81;
    /// SCTE-35 splice information.
    pub const SCTE35: u8 = 0x86;
    /// E-AC-3 Audio (ATSC).
    pub const EAC3_AUDIO: u8 = 0x87;
}

/// A single elementary stream entry in the PMT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Program {
    /// Stream type.
    pub stream_type: u8,
    /// Elementary PID.
    pub elementary_pid: u16,
    /// Declared ES_info_length.
    pub es_info_length: u16,
    /// Reserved bits: 3 before the PID (high nibble) and 4 before ES_info_length.
    pub reserved: u8,
    /// ES info descriptors.
    pub descriptors: Vec<Descriptor>,
}

impl Program {
    /// Check if this is a video stream.
    pub fn is_video(&self) -> bool {
        matches!(
            self.stream_type,
            stream_type::MPEG1_VIDEO
                | stream_type::MPEG2_VIDEO
                | stream_type::H264_VIDEO
                | stream_type::H265_VIDEO
        )
    }

    /// Check if this is an audio stream.
    pub fn is_audio(&self) -> bool {
        matches!(
            self.stream_type,
            stream_type::MPEG1_AUDIO
                | stream_type::MPEG2_AUDIO
                | stream_type::AAC_AUDIO
                | stream_type::AAC_LATM
                | stream_type::AC3_AUDIO
                | stream_type::EAC3_AUDIO
        )
    }

    /// ISO 639 language codes carried by this stream's descriptors.
    ///
    /// Malformed language descriptors are skipped.
    pub fn languages(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .filter_map(|d| d.as_iso639_language())
            .filter_map(Result::ok)
            .flat_map(|d| d.languages.into_iter().map(|l| l.code))
            .collect()
    }

    /// Get a human-readable stream type name.
    pub fn stream_type_name(&self) -> &'static str {
        match self.stream_type {
            stream_type::MPEG1_VIDEO => "MPEG-1 Video",
            stream_type::MPEG2_VIDEO => "MPEG-2 Video",
            stream_type::MPEG1_AUDIO => "MPEG-1 Audio",
            stream_type::MPEG2_AUDIO => "MPEG-2 Audio",
            stream_type::PRIVATE_SECTIONS => "Private Sections",
            stream_type::PES_PRIVATE_DATA => "PES Private Data",
            stream_type::AAC_AUDIO => "AAC Audio (ADTS)",
            stream_type::AAC_LATM => "AAC Audio (LATM)",
            stream_type::H264_VIDEO => "H.264/AVC Video",
            stream_type::H265_VIDEO => "H.265/HEVC Video",
            stream_type::AC3_AUDIO => "AC-3 Audio",
            stream_type::SCTE35 => "SCTE-35",
            stream_type::EAC3_AUDIO => "E-AC-3 Audio",
            _ => "Unknown",
        }
    }
}

/// Parsed PMT (Program Map Table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PmtTable {
    /// Section header.
    pub header: PsiHeader,
    /// Three reserved bits preceding the PCR PID.
    pub reserved_pcr: u8,
    /// PCR PID.
    pub pcr_pid: u16,
    /// Four reserved bits preceding program_info_length.
    pub reserved_info: u8,
    /// Declared program_info_length.
    pub program_info_length: u16,
    /// Program info descriptors.
    pub program_info: Vec<Descriptor>,
    /// Elementary streams.
    pub programs: Vec<Program>,
    /// CRC32 as transmitted.
    pub crc32: u32,
    #[serde(skip)]
    crc_valid: bool,
}

/// Parse a PMT section starting at table_id.
pub fn parse_pmt(data: &[u8]) -> Result<PmtTable, ParseError> {
    let section = PsiSection::parse(data)?;
    PmtTable::from_section(&section)
}

impl PmtTable {
    /// Build a PMT from an already parsed PSI section.
    ///
    /// `section.data` already stops at the smaller of the buffer and the
    /// declared section end, so no walk below can read past either.
    pub fn from_section(section: &PsiSection) -> Result<Self, ParseError> {
        section.expect_table(table_id::PMT)?;

        let mut reader = ByteReader::new(section.data);

        let pcr_field = reader.u16()?;
        let info_field = reader.u16()?;
        let program_info_length = info_field & 0x0FFF;
        let program_info = Descriptor::parse_loop(reader.take(program_info_length as usize)?)?;

        let mut programs = Vec::new();
        while !reader.is_empty() {
            if programs.len() == MAX_PMT_STREAMS {
                return Err(ParseError::TooManyEntries {
                    count: programs.len() + 1,
                    max: MAX_PMT_STREAMS,
                });
            }

            let stream_type = reader.u8()?;
            let pid_field = reader.u16()?;
            let es_field = reader.u16()?;
            let es_info_length = es_field & 0x0FFF;
            let descriptors = Descriptor::parse_loop(reader.take(es_info_length as usize)?)?;

            programs.push(Program {
                stream_type,
                elementary_pid: pid_field & 0x1FFF,
                es_info_length,
                reserved: (((pid_field >> 13) as u8) << 4) | (es_field >> 12) as u8,
                descriptors,
            });
        }

        Ok(PmtTable {
            header: section.header,
            reserved_pcr: (pcr_field >> 13) as u8,
            pcr_pid: pcr_field & 0x1FFF,
            reserved_info: (info_field >> 12) as u8,
            program_info_length,
            program_info,
            programs,
            crc32: section.crc32,
            crc_valid: section.verify_crc(),
        })
    }

    /// Program number (service ID).
    pub fn program_number(&self) -> u16 {
        self.header.table_id_extension
    }

    /// Whether the transmitted CRC matched the section contents.
    pub fn crc_ok(&self) -> bool {
        self.crc_valid
    }

    /// Audio-language index: elementary PID to the languages it carries.
    ///
    /// Includes every non-video stream that carries an ISO 639 language
    /// descriptor (AC-3 is often signalled as private data).
    pub fn audio_language_index(&self) -> BTreeMap<u16, Vec<String>> {
        self.programs
            .iter()
            .filter(|p| !p.is_video())
            .filter_map(|p| {
                let languages = p.languages();
                (!languages.is_empty()).then_some((p.elementary_pid, languages))
            })
            .collect()
    }

    /// Get video stream PIDs.
    pub fn video_pids(&self) -> Vec<u16> {
        self.programs
            .iter()
            .filter(|s| s.is_video())
            .map(|s| s.elementary_pid)
            .collect()
    }

    /// Get audio stream PIDs.
    pub fn audio_pids(&self) -> Vec<u16> {
        self.programs
            .iter()
            .filter(|s| s.is_audio())
            .map(|s| s.elementary_pid)
            .collect()
    }
}

impl fmt::Display for PmtTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(
            f,
            "PMT: program_number=0x{:04X} section_length={} version={} current_next={} pcr_pid=0x{:04X} program_info_length={}",
            h.table_id_extension,
            h.section_length,
            h.version_number,
            h.current_next_indicator as u8,
            self.pcr_pid,
            self.program_info_length
        )?;
        for descriptor in &self.program_info {
            writeln!(f, "  {}", descriptor)?;
        }
        for program in &self.programs {
            writeln!(
                f,
                "  stream_type=0x{:02X} ({}) elementary_pid=0x{:04X} es_info_length={}",
                program.stream_type,
                program.stream_type_name(),
                program.elementary_pid,
                program.es_info_length
            )?;
            for descriptor in &program.descriptors {
                writeln!(f, "    {}", descriptor)?;
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
