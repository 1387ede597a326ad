//! Length-free string encoding.
//!
//! Each UTF-16 code unit is written on its own:
//!
//! | Bytes | Meaning |
//! |---|---|
//! | `0xxxxxxx` | unit < 0x80 |
//! | `10hhhhhh llllllll` | unit < 0x4000 |
//! | `0xC0 hi lo` | any unit |
//! | `0xC1` | end of string |
//! | `0xC2` | null string |
//!
//! Bytes `0xC3..=0xFF` never start a unit.

use crate::codec::{Progress, ReadCursor, WriteCursor};
use crate::error::CodecError;
use crate::need;

const WIDE: u8 = 0xC0;
const EOF: u8 = 0xC1;
const NULL: u8 = 0xC2;

fn unit_width(unit: u16) -> usize {
    match unit {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        _ => 3,
    }
}

/// Number of bytes `s` occupies on the wire.
pub fn encoded_len(s: Option<&str>) -> usize {
    match s {
        None => 1,
        Some(s) => s.encode_utf16().map(unit_width).sum::<usize>() + 1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringEncoder {
    units: Option<Vec<u16>>,
    pos: usize,
}

impl StringEncoder {
    pub fn new(s: Option<&str>) -> Self {
        Self {
            units: s.map(|s| s.encode_utf16().collect()),
            pos: 0,
        }
    }

    pub fn encode(&mut self, cur: &mut WriteCursor) -> Result<Progress<()>, CodecError> {
        let Some(units) = &self.units else {
            if !cur.can_write(1) {
                return Ok(Progress::Suspended);
            }
            cur.put_u8(NULL);
            return Ok(Progress::Done(()));
        };

        while let Some(&unit) = units.get(self.pos) {
            let width = unit_width(unit);
            if !cur.can_write(width) {
                return Ok(Progress::Suspended);
            }
            match width {
                1 => cur.put_u8(unit as u8),
                2 => cur.put_u16(0x8000 | unit),
                _ => {
                    cur.put_u8(WIDE);
                    cur.put_u16(unit);
                }
            }
            self.pos += 1;
        }

        if !cur.can_write(1) {
            return Ok(Progress::Suspended);
        }
        cur.put_u8(EOF);
        Ok(Progress::Done(()))
    }
}

/// Decodes one string; `Done(None)` is the null string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringDecoder {
    units: Vec<u16>,
}

impl StringDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, cur: &mut ReadCursor) -> Result<Progress<Option<String>>, CodecError> {
        loop {
            let tag = need!(cur.peek_u8());
            match tag {
                0x00..=0x7F => {
                    cur.try_u8();
                    self.units.push(tag as u16);
                }
                0x80..=0xBF => {
                    let v = need!(cur.try_u16());
                    self.units.push(v & 0x3FFF);
                }
                WIDE => {
                    if !cur.can_read(3) {
                        return Ok(Progress::Suspended);
                    }
                    cur.try_u8();
                    let v = need!(cur.try_u16());
                    self.units.push(v);
                }
                EOF => {
                    cur.try_u8();
                    let units = std::mem::take(&mut self.units);
                    let s = String::from_utf16(&units).map_err(|_| CodecError::InvalidUtf16)?;
                    return Ok(Progress::Done(Some(s)));
                }
                NULL => {
                    if !self.units.is_empty() {
                        return Err(CodecError::MisplacedNull);
                    }
                    cur.try_u8();
                    return Ok(Progress::Done(None));
                }
                other => return Err(CodecError::InvalidTag(other)),
            }
        }
    }
}
