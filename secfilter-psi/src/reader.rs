//! Bounds-checked big-endian cursor over section bytes.

use crate::error::ParseError;

/// Cursor that checks the remaining length before every read.
#[derive(Debug, Clone)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn ensure(&self, n: usize) -> Result<(), ParseError> {
        if self.remaining() < n {
            return Err(ParseError::too_short(self.pos + n, self.data.len()));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ParseError> {
        self.ensure(1)?;
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ParseError> {
        self.ensure(2)?;
        let value = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ParseError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        self.ensure(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_big_endian() {
        let mut reader = ByteReader::new(&[0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF, 0x7F]);
        assert_eq!(reader.u16().unwrap(), 0x1234);
        assert_eq!(reader.u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.u8().unwrap(), 0x7F);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_short_read_does_not_advance() {
        let mut reader = ByteReader::new(&[0x01]);
        assert_eq!(
            reader.u16(),
            Err(ParseError::TooShort {
                needed: 2,
                available: 1
            })
        );
        assert_eq!(reader.u8().unwrap(), 0x01);
    }
}
