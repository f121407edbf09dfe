use std::io;

use radiation::{Absorb, Emit};
use serde::{Serialize, Deserialize};

use super::{
    codec::{DecodeError, Fixed, Reader, WireWrite},
    UnitId,
};

/// Commands share the packet tag space, at or above this base.
pub const COMMAND_BASE: u8 = 0xf0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Clear,
    Flush,
    End,
    CaptureEnabled(bool),
}

impl Command {
    pub fn tag(&self) -> u8 {
        match self {
            Command::Clear => COMMAND_BASE,
            Command::Flush => COMMAND_BASE + 1,
            Command::End => COMMAND_BASE + 2,
            Command::CaptureEnabled(_) => COMMAND_BASE + 3,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.tag());
        if let Command::CaptureEnabled(enabled) = self {
            buf.put_bool(*enabled);
        }
    }

    /// The tag is already consumed.
    pub fn decode(tag: u8, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match tag.wrapping_sub(COMMAND_BASE) {
            0 => Ok(Command::Clear),
            1 => Ok(Command::Flush),
            2 => Ok(Command::End),
            3 => Ok(Command::CaptureEnabled(r.bool()?)),
            _ => Err(DecodeError::UnknownTag(tag)),
        }
    }
}

/// How the body of an executable unit is instrumented.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Absorb,
    Emit,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[tag(u8)]
pub enum InstrumentationMode {
    #[default]
    #[tag(0)]
    None,
    #[tag(1)]
    Envelope,
    #[tag(2)]
    Full,
}

/// How call sites targeting a unit are instrumented.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Absorb,
    Emit,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[tag(u8)]
pub enum CallMode {
    #[default]
    #[tag(0)]
    Unmonitored,
    #[tag(1)]
    Monitored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Absorb, Emit, Serialize, Deserialize)]
pub struct ModeChange {
    pub unit: UnitId,
    pub instrumentation: InstrumentationMode,
    pub call: CallMode,
}

impl Fixed for ModeChange {
    const SIZE: usize = 6; // unit 4 + instrumentation 1 + call 1
}

impl ModeChange {
    pub fn encode_batch(changes: &[ModeChange], buf: &mut Vec<u8>) {
        buf.put_u32(changes.len() as u32);
        for change in changes {
            buf.put_fixed(change);
        }
    }

    pub fn decode_batch(r: &mut Reader<'_>) -> Result<Vec<Self>, DecodeError> {
        let count = r.length(Self::SIZE)?;
        (0..count).map(|_| r.fixed()).collect()
    }

    /// Writes one batch on the reverse stream, prefixed by its length in bytes.
    pub fn write_batch<W>(w: &mut W, changes: &[ModeChange]) -> io::Result<()>
    where
        W: io::Write,
    {
        let mut batch = vec![];
        Self::encode_batch(changes, &mut batch);
        w.write_all(&(batch.len() as u32).to_be_bytes())?;
        w.write_all(&batch)?;
        w.flush()
    }

    /// Returns `None` on a clean end of stream.
    pub fn read_batch<R>(r: &mut R) -> io::Result<Option<Vec<ModeChange>>>
    where
        R: io::Read,
    {
        let mut len = [0; 4];
        match r.read_exact(&mut len) {
            Ok(()) => (),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        let mut batch = vec![0; u32::from_be_bytes(len) as usize];
        r.read_exact(&mut batch)?;
        Self::decode_batch(&mut Reader::new(&batch))
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{ModeChange, InstrumentationMode, CallMode, Command, Reader};
    use crate::{DecodeError, UnitId};

    #[test]
    fn mode_change_stream() {
        let first = [
            ModeChange {
                unit: UnitId(3),
                instrumentation: InstrumentationMode::Envelope,
                call: CallMode::Monitored,
            },
            ModeChange {
                unit: UnitId(9),
                instrumentation: InstrumentationMode::Full,
                call: CallMode::Monitored,
            },
        ];
        let mut stream = vec![];
        ModeChange::write_batch(&mut stream, &first).unwrap();
        ModeChange::write_batch(&mut stream, &[]).unwrap();
        assert_eq!(
            hex::encode(&stream[..10]),
            "00000010000000020000"
        );

        let mut r = Cursor::new(stream);
        assert_eq!(ModeChange::read_batch(&mut r).unwrap().unwrap(), first);
        assert!(ModeChange::read_batch(&mut r).unwrap().unwrap().is_empty());
        assert!(ModeChange::read_batch(&mut r).unwrap().is_none());
    }

    #[test]
    fn unknown_mode() {
        // one change of unit 3 with instrumentation 3
        let batch = hex::decode("00000001000000030301").expect("valid constant");
        let err = ModeChange::decode_batch(&mut Reader::new(&batch)).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)), "{err}");
    }

    #[test]
    fn commands() {
        for command in [
            Command::Clear,
            Command::Flush,
            Command::End,
            Command::CaptureEnabled(false),
            Command::CaptureEnabled(true),
        ] {
            let mut buf = vec![];
            command.encode(&mut buf);
            let mut r = Reader::new(&buf);
            let tag = r.u8().unwrap();
            assert!(tag >= super::COMMAND_BASE);
            assert_eq!(Command::decode(tag, &mut r).unwrap(), command);
            assert!(r.is_empty());
        }
    }
}
