use radiation::{Absorb, Emit};
use serde::{Serialize, Deserialize};

use super::{
    codec::{DecodeError, Fixed, Reader, WireWrite},
    IdDelta, TypeId, Value,
};

/// Contents of an object sent by value. Node `0` is the object itself,
/// nested objects sent by value are further nodes, so cycles are expressible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGraph {
    pub nodes: Vec<ObjectNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectNode {
    pub type_id: TypeId,
    pub payload: NodePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePayload {
    Text(String),
    Fields(Vec<(String, GraphValue)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphValue {
    Value(Value),
    Node(u32),
}

#[derive(Clone, Absorb, Emit)]
#[tag(u8)]
enum NodeKind {
    #[tag(0)]
    Text,
    #[tag(1)]
    Fields,
}

#[derive(Absorb, Emit)]
struct NodeHeader {
    type_id: TypeId,
    kind: NodeKind,
}

impl Fixed for NodeHeader {
    const SIZE: usize = 5;
}

impl ObjectGraph {
    pub fn root(&self) -> Option<&ObjectNode> {
        self.nodes.first()
    }

    pub fn text(type_id: TypeId, text: impl Into<String>) -> Self {
        ObjectGraph {
            nodes: vec![ObjectNode {
                type_id,
                payload: NodePayload::Text(text.into()),
            }],
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>, ids: &mut IdDelta) {
        buf.put_u32(self.nodes.len() as u32);
        for node in &self.nodes {
            let kind = match &node.payload {
                NodePayload::Text(_) => NodeKind::Text,
                NodePayload::Fields(_) => NodeKind::Fields,
            };
            buf.put_fixed(&NodeHeader {
                type_id: node.type_id,
                kind,
            });
            match &node.payload {
                NodePayload::Text(text) => buf.put_utf(text),
                NodePayload::Fields(fields) => {
                    buf.put_u32(fields.len() as u32);
                    for (name, value) in fields {
                        buf.put_utf(name);
                        match value {
                            GraphValue::Value(value) => {
                                buf.put_u8(0);
                                value.encode(buf, ids);
                            }
                            GraphValue::Node(index) => {
                                buf.put_u8(1);
                                buf.put_u32(*index);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn decode(r: &mut Reader<'_>, ids: &mut IdDelta) -> Result<Self, DecodeError> {
        let count = r.length(NodeHeader::SIZE)?;
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let NodeHeader { type_id, kind } = r.fixed()?;
            let payload = match kind {
                NodeKind::Text => NodePayload::Text(r.utf()?),
                NodeKind::Fields => {
                    let n = r.length(5)?;
                    let mut fields = Vec::with_capacity(n);
                    for _ in 0..n {
                        let name = r.utf()?;
                        let value = match r.u8()? {
                            0 => GraphValue::Value(Value::decode(r, ids)?),
                            1 => {
                                let index = r.u32()?;
                                if index as usize >= count {
                                    return Err(DecodeError::NodeOutOfRange {
                                        index,
                                        count: count as u32,
                                    });
                                }
                                GraphValue::Node(index)
                            }
                            value => {
                                return Err(DecodeError::UnknownVariant {
                                    what: "graph value",
                                    value,
                                })
                            }
                        };
                        fields.push((name, value));
                    }
                    NodePayload::Fields(fields)
                }
            };
            nodes.push(ObjectNode { type_id, payload });
        }
        Ok(ObjectGraph { nodes })
    }
}
