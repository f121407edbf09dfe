use std::{any, char};

use radiation::{AbsorbExt, Emit};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end, need {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),
    #[error("unknown {what} {value}")]
    UnknownVariant { what: &'static str, value: u8 },
    #[error("bad length {0}")]
    BadLength(u64),
    #[error("graph node {index} out of range, graph has {count} nodes")]
    NodeOutOfRange { index: u32, count: u32 },
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// A run of fixed-width fields, coded by `radiation`.
pub trait Fixed: for<'pa> AbsorbExt<'pa> + Emit<Vec<u8>> {
    const SIZE: usize;
}

/// Append big-endian primitives to a buffer.
pub trait WireWrite {
    fn put_u8(&mut self, v: u8);

    fn put_u16(&mut self, v: u16);

    fn put_u32(&mut self, v: u32);

    fn put_u64(&mut self, v: u64);

    fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    fn put_fixed<T>(&mut self, v: &T)
    where
        T: Fixed;

    /// Length in UTF-16 code units, then the code units.
    fn put_utf(&mut self, s: &str) {
        let len = s.encode_utf16().count();
        self.put_u32(len as u32);
        for unit in s.encode_utf16() {
            self.put_u16(unit);
        }
    }
}

impl WireWrite for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_fixed<T>(&mut self, v: &T)
    where
        T: Fixed,
    {
        v.emit(self);
    }
}

pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

macro_rules! read_be {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, DecodeError> {
            self.array().map(<$ty>::from_be_bytes)
        }
    };
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(DecodeError::UnexpectedEnd { needed, remaining });
        }
        let s = &self.bytes[self.pos..(self.pos + needed)];
        self.pos += needed;
        Ok(s)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let s = self.take(N)?;
        Ok(s.try_into().expect("length checked by `take`"))
    }

    read_be!(u8, u8);
    read_be!(i8, i8);
    read_be!(u16, u16);
    read_be!(i16, i16);
    read_be!(u32, u32);
    read_be!(i32, i32);
    read_be!(u64, u64);
    read_be!(i64, i64);

    pub fn fixed<T>(&mut self) -> Result<T, DecodeError>
    where
        T: Fixed,
    {
        let bytes = self.take(T::SIZE)?;
        T::absorb_ext(bytes).map_err(|_| DecodeError::Malformed(any::type_name::<T>()))
    }

    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::UnknownVariant {
                what: "bool",
                value,
            }),
        }
    }

    /// Reads a length that must fit in what is left of the buffer given `unit` bytes per item.
    pub fn length(&mut self, unit: usize) -> Result<usize, DecodeError> {
        let len = self.u32()? as usize;
        let remaining = self.remaining();
        if len.saturating_mul(unit) > remaining {
            return Err(DecodeError::UnexpectedEnd {
                needed: len.saturating_mul(unit),
                remaining,
            });
        }
        Ok(len)
    }

    pub fn utf(&mut self) -> Result<String, DecodeError> {
        let len = self.length(2)?;
        let units = self.take(len * 2)?;
        let units = units
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]));
        Ok(char::decode_utf16(units)
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{Reader, WireWrite, DecodeError};

    #[test]
    fn utf_is_code_units() {
        let mut buf = vec![];
        buf.put_utf("añ𝄞");
        // 4 code units, the clef is a surrogate pair
        assert_eq!(hex::encode(&buf), "000000040061 00f1d834dd1e".replace(' ', ""));
        let mut r = Reader::new(&buf);
        assert_eq!(r.utf().unwrap(), "añ𝄞");
        assert!(r.is_empty());
    }

    #[test]
    fn lone_surrogate_is_replaced() {
        let buf = hex::decode("00000001d800").expect("valid constant");
        let mut r = Reader::new(&buf);
        assert_eq!(r.utf().unwrap(), "\u{fffd}");
    }

    #[test]
    fn truncated_text() {
        let buf = hex::decode("0000000a0061").expect("valid constant");
        let mut r = Reader::new(&buf);
        assert_eq!(
            r.utf(),
            Err(DecodeError::UnexpectedEnd {
                needed: 20,
                remaining: 2
            })
        );
    }

    #[test]
    fn primitives_are_big_endian() {
        let mut buf = vec![];
        buf.put_u32(0x01020304);
        buf.put_i64(-2);
        assert_eq!(hex::encode(&buf), "01020304fffffffffffffffe");
        let mut r = Reader::new(&buf);
        assert_eq!(r.u32().unwrap(), 0x01020304);
        assert_eq!(r.i64().unwrap(), -2);
        assert_eq!(
            r.u8(),
            Err(DecodeError::UnexpectedEnd {
                needed: 1,
                remaining: 0
            })
        );
    }
}
