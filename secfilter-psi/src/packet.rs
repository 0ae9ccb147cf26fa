//! 188-byte transport packets and a resynchronising packet walker.

use crate::error::ParseError;

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

const HEADER_LEN: usize = 4;

/// The 4-byte packet header following the sync byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub transport_priority: bool,
    /// 13-bit packet identifier.
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
}

impl TsHeader {
    fn from_word(word: u32) -> Self {
        Self {
            transport_error: word & 0x0080_0000 != 0,
            payload_unit_start: word & 0x0040_0000 != 0,
            transport_priority: word & 0x0020_0000 != 0,
            pid: ((word >> 8) & 0x1FFF) as u16,
            scrambling_control: ((word >> 6) & 0x03) as u8,
            adaptation_field_control: ((word >> 4) & 0x03) as u8,
            continuity_counter: (word & 0x0F) as u8,
        }
    }

    pub fn has_adaptation_field(&self) -> bool {
        matches!(self.adaptation_field_control, 0b10 | 0b11)
    }

    pub fn has_payload(&self) -> bool {
        matches!(self.adaptation_field_control, 0b01 | 0b11)
    }

    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control != 0
    }
}

/// The parts of the adaptation field section reassembly cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptationField {
    pub length: u8,
    pub discontinuity: bool,
    pub random_access: bool,
    /// 27 MHz program clock reference.
    pub pcr: Option<u64>,
}

impl AdaptationField {
    /// `body` is the field after its length byte.
    fn parse(length: u8, body: &[u8]) -> Self {
        let mut field = Self {
            length,
            ..Default::default()
        };
        let Some((&flags, rest)) = body.split_first() else {
            return field;
        };
        field.discontinuity = flags & 0x80 != 0;
        field.random_access = flags & 0x40 != 0;
        if flags & 0x10 != 0 && rest.len() >= 6 {
            let raw = rest[..6]
                .iter()
                .fold(0u64, |acc, &b| (acc << 8) | b as u64);
            let base = raw >> 15;
            let extension = raw & 0x1FF;
            field.pcr = Some(base * 300 + extension);
        }
        field
    }
}

/// One transport packet borrowed from a larger buffer.
#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    pub header: TsHeader,
    pub adaptation_field: Option<AdaptationField>,
    /// Empty when the packet carries no payload.
    pub payload: &'a [u8],
    /// The whole packet, sync byte included.
    pub raw: &'a [u8],
}

impl<'a> TsPacket<'a> {
    /// Parse the packet at the start of `data`; bytes past 188 are ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        let raw = data.get(..TS_PACKET_SIZE).ok_or(ParseError::TooShort {
            needed: TS_PACKET_SIZE,
            available: data.len(),
        })?;
        if raw[0] != SYNC_BYTE {
            return Err(ParseError::InvalidSyncByte(raw[0]));
        }

        let header = TsHeader::from_word(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]));

        let (adaptation_field, payload_start) = if header.has_adaptation_field() {
            let length = raw[HEADER_LEN];
            let body_end = (HEADER_LEN + 1 + length as usize).min(TS_PACKET_SIZE);
            let field = AdaptationField::parse(length, &raw[HEADER_LEN + 1..body_end]);
            (Some(field), HEADER_LEN + 1 + length as usize)
        } else {
            (None, HEADER_LEN)
        };

        let payload = match raw.get(payload_start..) {
            Some(rest) if header.has_payload() => rest,
            _ => &[],
        };

        Ok(Self {
            header,
            adaptation_field,
            payload,
            raw,
        })
    }

    /// Adaptation-field discontinuity indicator, false without a field.
    pub fn discontinuity(&self) -> bool {
        self.adaptation_field.map_or(false, |field| field.discontinuity)
    }
}

/// Walks a byte buffer packet by packet, skipping garbage between packets.
///
/// Stops before a trailing partial packet; [`offset`](Self::offset) tells the
/// caller where the unconsumed tail begins.
pub struct TsPacketIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TsPacketIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let mut iter = Self { data, offset: 0 };
        iter.seek_sync(0);
        iter
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Move to the first sync byte at or after `from`, or to the end.
    fn seek_sync(&mut self, from: usize) {
        let found = self.data[from.min(self.data.len())..]
            .iter()
            .position(|&b| b == SYNC_BYTE);
        self.offset = match found {
            Some(pos) => from + pos,
            None => self.data.len(),
        };
    }
}

impl<'a> Iterator for TsPacketIterator<'a> {
    type Item = TsPacket<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.data.len() - self.offset >= TS_PACKET_SIZE {
            match TsPacket::parse(&self.data[self.offset..]) {
                Ok(packet) => {
                    self.offset += TS_PACKET_SIZE;
                    return Some(packet);
                }
                Err(_) => self.seek_sync(self.offset + 1),
            }
        }
        None
    }
}
