use serde::{Serialize, Deserialize};

use super::{
    codec::{DecodeError, Reader, WireWrite},
    ObjectId,
};

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const BYTE: u8 = 2;
    pub const CHAR: u8 = 3;
    pub const SHORT: u8 = 4;
    pub const INT: u8 = 5;
    pub const LONG: u8 = 6;
    pub const FLOAT: u8 = 7;
    pub const DOUBLE: u8 = 8;
    pub const OBJECT: u8 = 9;
    pub const OBJECT_DELTA: u8 = 10;
}

/// A captured value. Floating point values compare by bit pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectId),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use self::Value::*;

        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Byte(a), Byte(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Short(a), Short(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Object(a), Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>, ids: &mut IdDelta) {
        match *self {
            Value::Null => buf.put_u8(tag::NULL),
            Value::Bool(v) => {
                buf.put_u8(tag::BOOL);
                buf.put_bool(v);
            }
            Value::Byte(v) => {
                buf.put_u8(tag::BYTE);
                buf.put_u8(v as u8);
            }
            Value::Char(v) => {
                buf.put_u8(tag::CHAR);
                buf.put_u16(v);
            }
            Value::Short(v) => {
                buf.put_u8(tag::SHORT);
                buf.put_u16(v as u16);
            }
            Value::Int(v) => {
                buf.put_u8(tag::INT);
                buf.put_i32(v);
            }
            Value::Long(v) => {
                buf.put_u8(tag::LONG);
                buf.put_i64(v);
            }
            Value::Float(v) => {
                buf.put_u8(tag::FLOAT);
                buf.put_u32(v.to_bits());
            }
            Value::Double(v) => {
                buf.put_u8(tag::DOUBLE);
                buf.put_u64(v.to_bits());
            }
            Value::Object(id) => ids.encode(id, buf),
        }
    }

    pub fn decode(r: &mut Reader<'_>, ids: &mut IdDelta) -> Result<Self, DecodeError> {
        let v = match r.u8()? {
            tag::NULL => Value::Null,
            tag::BOOL => Value::Bool(r.bool()?),
            tag::BYTE => Value::Byte(r.i8()?),
            tag::CHAR => Value::Char(r.u16()?),
            tag::SHORT => Value::Short(r.i16()?),
            tag::INT => Value::Int(r.i32()?),
            tag::LONG => Value::Long(r.i64()?),
            tag::FLOAT => Value::Float(f32::from_bits(r.u32()?)),
            tag::DOUBLE => Value::Double(f64::from_bits(r.u64()?)),
            tag::OBJECT => Value::Object(ids.absolute(r.u64()?)),
            tag::OBJECT_DELTA => Value::Object(ids.delta(r.i8()?)),
            t => return Err(DecodeError::UnknownValueTag(t)),
        };
        Ok(v)
    }
}

/// Delta state of object identities on one producer channel.
/// The encoder and the decoder of a channel must observe the same sequence of ids.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IdDelta {
    last: u64,
}

impl IdDelta {
    pub fn encode(&mut self, id: ObjectId, buf: &mut Vec<u8>) {
        let delta = id.0.wrapping_sub(self.last) as i64;
        match i8::try_from(delta) {
            Ok(delta) => {
                buf.put_u8(tag::OBJECT_DELTA);
                buf.put_u8(delta as u8);
            }
            Err(_) => {
                buf.put_u8(tag::OBJECT);
                buf.put_u64(id.0);
            }
        }
        self.last = id.0;
    }

    fn absolute(&mut self, id: u64) -> ObjectId {
        self.last = id;
        ObjectId(id)
    }

    fn delta(&mut self, delta: i8) -> ObjectId {
        let id = self.last.wrapping_add(delta as i64 as u64);
        self.absolute(id)
    }

    pub fn reset(&mut self) {
        self.last = 0;
    }
}
