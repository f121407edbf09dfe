use radiation::{Absorb, Emit};
use serde::{Serialize, Deserialize};

use super::{
    codec::{DecodeError, Fixed, Reader, WireWrite},
    control::{Command, COMMAND_BASE},
    AdviceId, FieldId, IdDelta, LoaderId, ObjectGraph, ObjectId, ProbeId, TypeId, UnitId, Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tag {
    RegisterObject = 1,
    RegisterRefObject = 2,
    RegisterType = 3,
    RegisterLoader = 4,
    RegisterThread = 5,
    Enter = 10,
    Exit = 11,
    ExitWithError = 12,
    FieldWrite = 13,
    ArrayWrite = 14,
    LocalWrite = 15,
    NewArray = 16,
    TypeCheck = 17,
    BeforeCallDry = 18,
    AfterCallDry = 19,
    BeforeCall = 20,
    AfterCall = 21,
    AfterCallWithError = 22,
    Output = 23,
    Exception = 24,
}

impl Tag {
    pub fn from_u8(c: u8) -> Option<Self> {
        let values = [
            Tag::RegisterObject,
            Tag::RegisterRefObject,
            Tag::RegisterType,
            Tag::RegisterLoader,
            Tag::RegisterThread,
            Tag::Enter,
            Tag::Exit,
            Tag::ExitWithError,
            Tag::FieldWrite,
            Tag::ArrayWrite,
            Tag::LocalWrite,
            Tag::NewArray,
            Tag::TypeCheck,
            Tag::BeforeCallDry,
            Tag::AfterCallDry,
            Tag::BeforeCall,
            Tag::AfterCall,
            Tag::AfterCallWithError,
            Tag::Output,
            Tag::Exception,
        ];
        values.into_iter().find(|v| *v as u8 == c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Absorb, Emit, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[tag(u8)]
pub enum OutputStream {
    #[tag(0)]
    Out,
    #[tag(1)]
    Err,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    RegisterObject {
        id: ObjectId,
        graph: ObjectGraph,
    },
    RegisterRefObject {
        id: ObjectId,
        type_id: TypeId,
        timestamp: u64,
    },
    RegisterType {
        id: TypeId,
        loader: LoaderId,
        name: String,
    },
    RegisterLoader {
        id: LoaderId,
        parent: LoaderId,
        name: String,
    },
    RegisterThread {
        host_id: u64,
        name: String,
    },
    Enter {
        timestamp: u64,
        unit: UnitId,
        target: Value,
        args: Vec<Value>,
    },
    Exit {
        timestamp: u64,
        unit: UnitId,
        probe: ProbeId,
        result: Value,
    },
    ExitWithError {
        timestamp: u64,
        unit: UnitId,
        probe: ProbeId,
        error: Value,
    },
    FieldWrite {
        timestamp: u64,
        probe: ProbeId,
        field: FieldId,
        target: Value,
        value: Value,
    },
    ArrayWrite {
        timestamp: u64,
        probe: ProbeId,
        target: Value,
        index: i32,
        value: Value,
    },
    LocalWrite {
        timestamp: u64,
        probe: ProbeId,
        slot: u32,
        value: Value,
    },
    NewArray {
        timestamp: u64,
        probe: ProbeId,
        target: Value,
        base_type: TypeId,
        size: i32,
    },
    TypeCheck {
        timestamp: u64,
        probe: ProbeId,
        value: Value,
        type_id: TypeId,
        result: bool,
    },
    BeforeCallDry {
        timestamp: u64,
        probe: ProbeId,
        unit: UnitId,
        advice: AdviceId,
    },
    AfterCallDry {
        timestamp: u64,
        probe: ProbeId,
    },
    BeforeCall {
        timestamp: u64,
        probe: ProbeId,
        unit: UnitId,
        target: Value,
        args: Vec<Value>,
    },
    AfterCall {
        timestamp: u64,
        probe: ProbeId,
        unit: UnitId,
        target: Value,
        result: Value,
    },
    AfterCallWithError {
        timestamp: u64,
        probe: ProbeId,
        unit: UnitId,
        target: Value,
        error: Value,
    },
    Output {
        timestamp: u64,
        stream: OutputStream,
        text: String,
    },
    Exception {
        timestamp: u64,
        unit: UnitId,
        probe: ProbeId,
        error: Value,
    },
    Command(Command),
}

/// Fixed-width runs of the records. Values, text and value lists between
/// them are coded by hand, values depend on the delta state of the channel.
mod record {
    use radiation::{Absorb, Emit};

    use super::OutputStream;
    use crate::{codec::Fixed, AdviceId, FieldId, LoaderId, ObjectId, ProbeId, TypeId, UnitId};

    macro_rules! fixed {
        ($name:ident, $size:expr) => {
            impl Fixed for $name {
                const SIZE: usize = $size;
            }
        };
    }

    fixed!(ObjectId, 8);

    #[derive(Absorb, Emit)]
    pub struct RefObject {
        pub id: ObjectId,
        pub type_id: TypeId,
        pub timestamp: u64,
    }
    fixed!(RefObject, 20);

    #[derive(Absorb, Emit)]
    pub struct TypeHeader {
        pub id: TypeId,
        pub loader: LoaderId,
    }
    fixed!(TypeHeader, 8);

    #[derive(Absorb, Emit)]
    pub struct LoaderHeader {
        pub id: LoaderId,
        pub parent: LoaderId,
    }
    fixed!(LoaderHeader, 8);

    #[derive(Absorb, Emit)]
    pub struct Entry {
        pub timestamp: u64,
        pub unit: UnitId,
    }
    fixed!(Entry, 12);

    /// Exit, exit with error and exception.
    #[derive(Absorb, Emit)]
    pub struct UnitProbe {
        pub timestamp: u64,
        pub unit: UnitId,
        pub probe: ProbeId,
    }
    fixed!(UnitProbe, 16);

    #[derive(Absorb, Emit)]
    pub struct Stamp {
        pub timestamp: u64,
        pub probe: ProbeId,
    }
    fixed!(Stamp, 12);

    #[derive(Absorb, Emit)]
    pub struct FieldSite {
        pub timestamp: u64,
        pub probe: ProbeId,
        pub field: FieldId,
    }
    fixed!(FieldSite, 16);

    #[derive(Absorb, Emit)]
    pub struct LocalSite {
        pub timestamp: u64,
        pub probe: ProbeId,
        pub slot: u32,
    }
    fixed!(LocalSite, 16);

    #[derive(Absorb, Emit)]
    pub struct ArrayShape {
        pub base_type: TypeId,
        pub size: i32,
    }
    fixed!(ArrayShape, 8);

    #[derive(Absorb, Emit)]
    pub struct CheckResult {
        pub type_id: TypeId,
        pub result: bool,
    }
    fixed!(CheckResult, 5);

    #[derive(Absorb, Emit)]
    pub struct DryCall {
        pub timestamp: u64,
        pub probe: ProbeId,
        pub unit: UnitId,
        pub advice: AdviceId,
    }
    fixed!(DryCall, 20);

    /// Before call, after call and after call with error.
    #[derive(Absorb, Emit)]
    pub struct CallSite {
        pub timestamp: u64,
        pub probe: ProbeId,
        pub unit: UnitId,
    }
    fixed!(CallSite, 16);

    #[derive(Absorb, Emit)]
    pub struct OutputHeader {
        pub timestamp: u64,
        pub stream: OutputStream,
    }
    fixed!(OutputHeader, 9);
}

use self::record::{
    ArrayShape, CallSite, CheckResult, DryCall, Entry, FieldSite, LoaderHeader, LocalSite,
    OutputHeader, RefObject, Stamp, TypeHeader, UnitProbe,
};

fn put_values(buf: &mut Vec<u8>, values: &[Value], ids: &mut IdDelta) {
    buf.put_u32(values.len() as u32);
    for value in values {
        value.encode(buf, ids);
    }
}

fn values(r: &mut Reader<'_>, ids: &mut IdDelta) -> Result<Vec<Value>, DecodeError> {
    // each value is at least its tag
    let len = r.length(1)?;
    (0..len).map(|_| Value::decode(r, ids)).collect()
}

impl Message {
    pub fn is_command(&self) -> bool {
        matches!(self, Message::Command(_))
    }

    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Message::RegisterRefObject { timestamp, .. }
            | Message::Enter { timestamp, .. }
            | Message::Exit { timestamp, .. }
            | Message::ExitWithError { timestamp, .. }
            | Message::FieldWrite { timestamp, .. }
            | Message::ArrayWrite { timestamp, .. }
            | Message::LocalWrite { timestamp, .. }
            | Message::NewArray { timestamp, .. }
            | Message::TypeCheck { timestamp, .. }
            | Message::BeforeCallDry { timestamp, .. }
            | Message::AfterCallDry { timestamp, .. }
            | Message::BeforeCall { timestamp, .. }
            | Message::AfterCall { timestamp, .. }
            | Message::AfterCallWithError { timestamp, .. }
            | Message::Output { timestamp, .. }
            | Message::Exception { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }

    fn tag(&self) -> Option<Tag> {
        let tag = match self {
            Message::RegisterObject { .. } => Tag::RegisterObject,
            Message::RegisterRefObject { .. } => Tag::RegisterRefObject,
            Message::RegisterType { .. } => Tag::RegisterType,
            Message::RegisterLoader { .. } => Tag::RegisterLoader,
            Message::RegisterThread { .. } => Tag::RegisterThread,
            Message::Enter { .. } => Tag::Enter,
            Message::Exit { .. } => Tag::Exit,
            Message::ExitWithError { .. } => Tag::ExitWithError,
            Message::FieldWrite { .. } => Tag::FieldWrite,
            Message::ArrayWrite { .. } => Tag::ArrayWrite,
            Message::LocalWrite { .. } => Tag::LocalWrite,
            Message::NewArray { .. } => Tag::NewArray,
            Message::TypeCheck { .. } => Tag::TypeCheck,
            Message::BeforeCallDry { .. } => Tag::BeforeCallDry,
            Message::AfterCallDry { .. } => Tag::AfterCallDry,
            Message::BeforeCall { .. } => Tag::BeforeCall,
            Message::AfterCall { .. } => Tag::AfterCall,
            Message::AfterCallWithError { .. } => Tag::AfterCallWithError,
            Message::Output { .. } => Tag::Output,
            Message::Exception { .. } => Tag::Exception,
            Message::Command(_) => return None,
        };
        Some(tag)
    }

    pub fn encode(&self, buf: &mut Vec<u8>, ids: &mut IdDelta) {
        if let Some(tag) = self.tag() {
            buf.put_u8(tag as u8);
        }
        match *self {
            Message::RegisterObject { id, ref graph } => {
                buf.put_fixed(&id);
                graph.encode(buf, ids);
            }
            Message::RegisterRefObject {
                id,
                type_id,
                timestamp,
            } => buf.put_fixed(&RefObject {
                id,
                type_id,
                timestamp,
            }),
            Message::RegisterType {
                id,
                loader,
                ref name,
            } => {
                buf.put_fixed(&TypeHeader { id, loader });
                buf.put_utf(name);
            }
            Message::RegisterLoader {
                id,
                parent,
                ref name,
            } => {
                buf.put_fixed(&LoaderHeader { id, parent });
                buf.put_utf(name);
            }
            Message::RegisterThread { host_id, ref name } => {
                buf.put_u64(host_id);
                buf.put_utf(name);
            }
            Message::Enter {
                timestamp,
                unit,
                target,
                ref args,
            } => {
                buf.put_fixed(&Entry { timestamp, unit });
                target.encode(buf, ids);
                put_values(buf, args, ids);
            }
            Message::Exit {
                timestamp,
                unit,
                probe,
                result: value,
            }
            | Message::ExitWithError {
                timestamp,
                unit,
                probe,
                error: value,
            }
            | Message::Exception {
                timestamp,
                unit,
                probe,
                error: value,
            } => {
                buf.put_fixed(&UnitProbe {
                    timestamp,
                    unit,
                    probe,
                });
                value.encode(buf, ids);
            }
            Message::FieldWrite {
                timestamp,
                probe,
                field,
                target,
                value,
            } => {
                buf.put_fixed(&FieldSite {
                    timestamp,
                    probe,
                    field,
                });
                target.encode(buf, ids);
                value.encode(buf, ids);
            }
            Message::ArrayWrite {
                timestamp,
                probe,
                target,
                index,
                value,
            } => {
                buf.put_fixed(&Stamp { timestamp, probe });
                target.encode(buf, ids);
                buf.put_i32(index);
                value.encode(buf, ids);
            }
            Message::LocalWrite {
                timestamp,
                probe,
                slot,
                value,
            } => {
                buf.put_fixed(&LocalSite {
                    timestamp,
                    probe,
                    slot,
                });
                value.encode(buf, ids);
            }
            Message::NewArray {
                timestamp,
                probe,
                target,
                base_type,
                size,
            } => {
                buf.put_fixed(&Stamp { timestamp, probe });
                target.encode(buf, ids);
                buf.put_fixed(&ArrayShape { base_type, size });
            }
            Message::TypeCheck {
                timestamp,
                probe,
                value,
                type_id,
                result,
            } => {
                buf.put_fixed(&Stamp { timestamp, probe });
                value.encode(buf, ids);
                buf.put_fixed(&CheckResult { type_id, result });
            }
            Message::BeforeCallDry {
                timestamp,
                probe,
                unit,
                advice,
            } => buf.put_fixed(&DryCall {
                timestamp,
                probe,
                unit,
                advice,
            }),
            Message::AfterCallDry { timestamp, probe } => buf.put_fixed(&Stamp { timestamp, probe }),
            Message::BeforeCall {
                timestamp,
                probe,
                unit,
                target,
                ref args,
            } => {
                buf.put_fixed(&CallSite {
                    timestamp,
                    probe,
                    unit,
                });
                target.encode(buf, ids);
                put_values(buf, args, ids);
            }
            Message::AfterCall {
                timestamp,
                probe,
                unit,
                target,
                result: value,
            }
            | Message::AfterCallWithError {
                timestamp,
                probe,
                unit,
                target,
                error: value,
            } => {
                buf.put_fixed(&CallSite {
                    timestamp,
                    probe,
                    unit,
                });
                target.encode(buf, ids);
                value.encode(buf, ids);
            }
            Message::Output {
                timestamp,
                stream,
                ref text,
            } => {
                buf.put_fixed(&OutputHeader { timestamp, stream });
                buf.put_utf(text);
            }
            Message::Command(command) => command.encode(buf),
        }
    }

    pub fn decode(r: &mut Reader<'_>, ids: &mut IdDelta) -> Result<Self, DecodeError> {
        let tag = r.u8()?;
        if tag >= COMMAND_BASE {
            return Command::decode(tag, r).map(Message::Command);
        }
        let tag = Tag::from_u8(tag).ok_or(DecodeError::UnknownTag(tag))?;
        let msg = match tag {
            Tag::RegisterObject => Message::RegisterObject {
                id: r.fixed()?,
                graph: ObjectGraph::decode(r, ids)?,
            },
            Tag::RegisterRefObject => {
                let RefObject {
                    id,
                    type_id,
                    timestamp,
                } = r.fixed()?;
                Message::RegisterRefObject {
                    id,
                    type_id,
                    timestamp,
                }
            }
            Tag::RegisterType => {
                let TypeHeader { id, loader } = r.fixed()?;
                let name = r.utf()?;
                Message::RegisterType { id, loader, name }
            }
            Tag::RegisterLoader => {
                let LoaderHeader { id, parent } = r.fixed()?;
                let name = r.utf()?;
                Message::RegisterLoader { id, parent, name }
            }
            Tag::RegisterThread => Message::RegisterThread {
                host_id: r.u64()?,
                name: r.utf()?,
            },
            Tag::Enter => {
                let Entry { timestamp, unit } = r.fixed()?;
                Message::Enter {
                    timestamp,
                    unit,
                    target: Value::decode(r, ids)?,
                    args: values(r, ids)?,
                }
            }
            Tag::Exit | Tag::ExitWithError | Tag::Exception => {
                let UnitProbe {
                    timestamp,
                    unit,
                    probe,
                } = r.fixed()?;
                let value = Value::decode(r, ids)?;
                match tag {
                    Tag::Exit => Message::Exit {
                        timestamp,
                        unit,
                        probe,
                        result: value,
                    },
                    Tag::ExitWithError => Message::ExitWithError {
                        timestamp,
                        unit,
                        probe,
                        error: value,
                    },
                    _ => Message::Exception {
                        timestamp,
                        unit,
                        probe,
                        error: value,
                    },
                }
            }
            Tag::FieldWrite => {
                let FieldSite {
                    timestamp,
                    probe,
                    field,
                } = r.fixed()?;
                Message::FieldWrite {
                    timestamp,
                    probe,
                    field,
                    target: Value::decode(r, ids)?,
                    value: Value::decode(r, ids)?,
                }
            }
            Tag::ArrayWrite => {
                let Stamp { timestamp, probe } = r.fixed()?;
                Message::ArrayWrite {
                    timestamp,
                    probe,
                    target: Value::decode(r, ids)?,
                    index: r.i32()?,
                    value: Value::decode(r, ids)?,
                }
            }
            Tag::LocalWrite => {
                let LocalSite {
                    timestamp,
                    probe,
                    slot,
                } = r.fixed()?;
                Message::LocalWrite {
                    timestamp,
                    probe,
                    slot,
                    value: Value::decode(r, ids)?,
                }
            }
            Tag::NewArray => {
                let Stamp { timestamp, probe } = r.fixed()?;
                let target = Value::decode(r, ids)?;
                let ArrayShape { base_type, size } = r.fixed()?;
                Message::NewArray {
                    timestamp,
                    probe,
                    target,
                    base_type,
                    size,
                }
            }
            Tag::TypeCheck => {
                let Stamp { timestamp, probe } = r.fixed()?;
                let value = Value::decode(r, ids)?;
                let CheckResult { type_id, result } = r.fixed()?;
                Message::TypeCheck {
                    timestamp,
                    probe,
                    value,
                    type_id,
                    result,
                }
            }
            Tag::BeforeCallDry => {
                let DryCall {
                    timestamp,
                    probe,
                    unit,
                    advice,
                } = r.fixed()?;
                Message::BeforeCallDry {
                    timestamp,
                    probe,
                    unit,
                    advice,
                }
            }
            Tag::AfterCallDry => {
                let Stamp { timestamp, probe } = r.fixed()?;
                Message::AfterCallDry { timestamp, probe }
            }
            Tag::BeforeCall => {
                let CallSite {
                    timestamp,
                    probe,
                    unit,
                } = r.fixed()?;
                Message::BeforeCall {
                    timestamp,
                    probe,
                    unit,
                    target: Value::decode(r, ids)?,
                    args: values(r, ids)?,
                }
            }
            Tag::AfterCall | Tag::AfterCallWithError => {
                let CallSite {
                    timestamp,
                    probe,
                    unit,
                } = r.fixed()?;
                let target = Value::decode(r, ids)?;
                let value = Value::decode(r, ids)?;
                if tag == Tag::AfterCall {
                    Message::AfterCall {
                        timestamp,
                        probe,
                        unit,
                        target,
                        result: value,
                    }
                } else {
                    Message::AfterCallWithError {
                        timestamp,
                        probe,
                        unit,
                        target,
                        error: value,
                    }
                }
            }
            Tag::Output => {
                let OutputHeader { timestamp, stream } = r.fixed()?;
                Message::Output {
                    timestamp,
                    stream,
                    text: r.utf()?,
                }
            }
        };
        Ok(msg)
    }
}

/// Decodes the messages of one complete packet, stops after the first error.
pub struct Messages<'a, 'd> {
    reader: Reader<'a>,
    ids: &'d mut IdDelta,
    failed: bool,
}

impl<'a, 'd> Messages<'a, 'd> {
    pub fn new(payload: &'a [u8], ids: &'d mut IdDelta) -> Self {
        Messages {
            reader: Reader::new(payload),
            ids,
            failed: false,
        }
    }

    pub fn position(&self) -> usize {
        self.reader.position()
    }
}

impl<'a, 'd> Iterator for Messages<'a, 'd> {
    type Item = Result<Message, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_empty() {
            return None;
        }
        let msg = Message::decode(&mut self.reader, self.ids);
        self.failed = msg.is_err();
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::{Message, Messages, OutputStream, Tag};
    use crate::{
        Command, DecodeError, IdDelta, ObjectGraph, ObjectId, ProbeId, TypeId, UnitId, Value,
        AdviceId, FieldId,
    };

    fn sample() -> Vec<Message> {
        vec![
            Message::RegisterObject {
                id: ObjectId(3),
                graph: ObjectGraph::text(TypeId(2), "hello"),
            },
            Message::Enter {
                timestamp: 10,
                unit: UnitId(4),
                target: Value::Object(ObjectId(3)),
                args: vec![Value::Int(1), Value::Null, Value::Object(ObjectId(5))],
            },
            Message::FieldWrite {
                timestamp: 11,
                probe: ProbeId(2),
                field: FieldId(1),
                target: Value::Object(ObjectId(3)),
                value: Value::Double(1.5),
            },
            Message::BeforeCallDry {
                timestamp: 12,
                probe: ProbeId(3),
                unit: UnitId(9),
                advice: AdviceId::NONE,
            },
            Message::AfterCallDry {
                timestamp: 13,
                probe: ProbeId(3),
            },
            Message::Output {
                timestamp: 14,
                stream: OutputStream::Err,
                text: "warning".to_owned(),
            },
            Message::Command(Command::CaptureEnabled(true)),
            Message::Exit {
                timestamp: 15,
                unit: UnitId(4),
                probe: ProbeId(4),
                result: Value::Bool(true),
            },
        ]
    }

    #[test]
    fn packet_round_trip() {
        let messages = sample();
        let mut ids = IdDelta::default();
        let mut buf = vec![];
        for msg in &messages {
            msg.encode(&mut buf, &mut ids);
        }

        let mut ids = IdDelta::default();
        let decoded = Messages::new(&buf, &mut ids)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn truncated_packet_stops() {
        let mut ids = IdDelta::default();
        let mut buf = vec![];
        for msg in &sample() {
            msg.encode(&mut buf, &mut ids);
        }
        buf.truncate(buf.len() - 3);

        let mut ids = IdDelta::default();
        let decoded = Messages::new(&buf, &mut ids).collect::<Vec<_>>();
        assert_eq!(decoded.len(), sample().len());
        assert!(matches!(
            decoded.last(),
            Some(Err(DecodeError::UnexpectedEnd { .. }))
        ));
    }

    #[test]
    fn fixed_layout() {
        let mut buf = vec![];
        let msg = Message::BeforeCallDry {
            timestamp: 0x0102,
            probe: ProbeId(3),
            unit: UnitId(4),
            advice: AdviceId(5),
        };
        msg.encode(&mut buf, &mut IdDelta::default());
        assert_eq!(hex::encode(&buf), "120000000000000102000000030000000400000005");

        let mut buf = vec![];
        let msg = Message::TypeCheck {
            timestamp: 1,
            probe: ProbeId(2),
            value: Value::Null,
            type_id: TypeId(7),
            result: true,
        };
        msg.encode(&mut buf, &mut IdDelta::default());
        // stamp, the null value, then type and result
        assert_eq!(hex::encode(&buf), "11000000000000000100000002000000000701");
    }

    #[test]
    fn unknown_output_stream() {
        // output at 1 on stream 2
        let buf = hex::decode("17000000000000000102").expect("valid constant");
        let mut ids = IdDelta::default();
        let decoded = Messages::new(&buf, &mut ids).collect::<Vec<_>>();
        assert!(matches!(decoded[..], [Err(DecodeError::Malformed(_))]));
    }

    #[test]
    fn unknown_tag() {
        let buf = [0x07, 0x00];
        let mut ids = IdDelta::default();
        let decoded = Messages::new(&buf, &mut ids).collect::<Vec<_>>();
        assert_eq!(decoded, vec![Err(DecodeError::UnknownTag(7))]);
        assert_eq!(Tag::from_u8(10), Some(Tag::Enter));
    }
}
