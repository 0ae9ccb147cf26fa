//! Descriptor parsing for PSI tables.
//!
//! Descriptors are kept raw in the tables and decoded on demand. Only the
//! tags needed downstream (audio language index, caption services) have a
//! typed view; everything else is skipped by its declared length.

use std::fmt;

use serde::Serialize;

use crate::descriptor_tag;
use crate::error::ParseError;
use crate::reader::ByteReader;

/// A raw descriptor (tag, length, payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    /// Descriptor tag.
    pub tag: u8,
    /// Declared payload length.
    pub length: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Descriptor {
    /// Walk a descriptor loop.
    ///
    /// The loop must be consumed exactly: a descriptor whose declared length
    /// runs past the end of `data` is an error.
    pub fn parse_loop(data: &[u8]) -> Result<Vec<Descriptor>, ParseError> {
        let mut reader = ByteReader::new(data);
        let mut descriptors = Vec::new();

        while !reader.is_empty() {
            let tag = reader.u8()?;
            let length = reader.u8()?;
            if length as usize > reader.remaining() {
                return Err(ParseError::DescriptorOverrun {
                    tag,
                    length: length as usize,
                    remaining: reader.remaining(),
                });
            }
            let payload = reader.take(length as usize)?.to_vec();
            descriptors.push(Descriptor {
                tag,
                length,
                payload,
            });
        }

        Ok(descriptors)
    }

    /// Decode as an ISO 639 language descriptor, if the tag matches.
    pub fn as_iso639_language(&self) -> Option<Result<Iso639LanguageDescriptor, ParseError>> {
        (self.tag == descriptor_tag::ISO_639_LANGUAGE)
            .then(|| Iso639LanguageDescriptor::parse(&self.payload))
    }

    /// Decode as a caption service descriptor, if the tag matches.
    pub fn as_caption_service(&self) -> Option<Result<CaptionServiceDescriptor, ParseError>> {
        (self.tag == descriptor_tag::CAPTION_SERVICE)
            .then(|| CaptionServiceDescriptor::parse(&self.payload))
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "descriptor tag=0x{:02X} length={}", self.tag, self.length)?;
        match self.tag {
            descriptor_tag::ISO_639_LANGUAGE => match Iso639LanguageDescriptor::parse(&self.payload) {
                Ok(lang) => write!(f, " [{}]", lang),
                Err(e) => write!(f, " [ISO 639 language: {}]", e),
            },
            descriptor_tag::CAPTION_SERVICE => match CaptionServiceDescriptor::parse(&self.payload) {
                Ok(cc) => write!(f, " [{}]", cc),
                Err(e) => write!(f, " [caption service: {}]", e),
            },
            _ => Ok(()),
        }
    }
}

/// Decode a 3-byte ISO 639-2 code (ISO 8859-1 characters).
fn language_code(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// One language entry of an ISO 639 language descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Iso639Language {
    /// ISO 639-2 code, e.g. "eng".
    pub code: String,
    /// Audio type (0 = undefined, 1 = clean effects, 2 = hearing impaired,
    /// 3 = visual impaired commentary).
    pub audio_type: u8,
}

impl Iso639Language {
    /// Get a human-readable audio type name.
    pub fn audio_type_name(&self) -> &'static str {
        match self.audio_type {
            0x00 => "Undefined",
            0x01 => "Clean effects",
            0x02 => "Hearing impaired",
            0x03 => "Visual impaired commentary",
            _ => "Reserved",
        }
    }
}

/// ISO 639 language descriptor (0x0A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Iso639LanguageDescriptor {
    pub languages: Vec<Iso639Language>,
}

impl Iso639LanguageDescriptor {
    /// Parse the descriptor payload (4 bytes per language).
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut reader = ByteReader::new(data);
        let mut languages = Vec::new();

        while !reader.is_empty() {
            let code = language_code(reader.take(3)?);
            let audio_type = reader.u8()?;
            languages.push(Iso639Language { code, audio_type });
        }

        Ok(Iso639LanguageDescriptor { languages })
    }
}

impl fmt::Display for Iso639LanguageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ISO 639 language:")?;
        for lang in &self.languages {
            write!(f, " {} ({})", lang.code, lang.audio_type_name())?;
        }
        Ok(())
    }
}

/// One entry of a caption service descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptionService {
    /// ISO 639-2 language code.
    pub language: String,
    /// True for CEA-708 digital captions, false for line-21 (CEA-608).
    pub digital_cc: bool,
    /// Line-21 field (only meaningful when `digital_cc` is false).
    pub line21_field: bool,
    /// CEA-708 service number (only meaningful when `digital_cc` is true).
    pub caption_service_number: u8,
    /// Easy-reader captions.
    pub easy_reader: bool,
    /// Formatted for 16:9.
    pub wide_aspect_ratio: bool,
}

/// ATSC caption service descriptor (0x86).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptionServiceDescriptor {
    pub services: Vec<CaptionService>,
}

impl CaptionServiceDescriptor {
    /// Parse the descriptor payload.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut reader = ByteReader::new(data);
        let number_of_services = (reader.u8()? & 0x1F) as usize;
        let mut services = Vec::with_capacity(number_of_services);

        for _ in 0..number_of_services {
            let language = language_code(reader.take(3)?);
            let flags = reader.u8()?;
            let digital_cc = flags & 0x80 != 0;
            let tail = reader.u16()?;

            services.push(CaptionService {
                language,
                digital_cc,
                line21_field: !digital_cc && flags & 0x01 != 0,
                caption_service_number: if digital_cc { flags & 0x3F } else { 0 },
                easy_reader: tail & 0x8000 != 0,
                wide_aspect_ratio: tail & 0x4000 != 0,
            });
        }

        Ok(CaptionServiceDescriptor { services })
    }
}

impl fmt::Display for CaptionServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("caption services:")?;
        for svc in &self.services {
            if svc.digital_cc {
                write!(f, " {} (708 service {})", svc.language, svc.caption_service_number)?;
            } else {
                write!(
                    f,
                    " {} (608 field {})",
                    svc.language,
                    if svc.line21_field { 2 } else { 1 }
                )?;
            }
        }
        Ok(())
    }
}
