use std::fmt;

use radiation::{Absorb, Emit};
use serde::{Serialize, Deserialize};

macro_rules! catalog_id {
    ($name:ident, $prefix:literal) => {
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
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Zero is never assigned, it encodes "absent" on the wire.
            pub const NONE: Self = $name(0);

            pub fn get(self) -> Option<Self> {
                if self.0 == 0 {
                    None
                } else {
                    Some(self)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

catalog_id!(TypeId, "type_");
catalog_id!(UnitId, "unit_");
catalog_id!(FieldId, "field_");
catalog_id!(ProbeId, "probe_");
catalog_id!(AdviceId, "advice_");
catalog_id!(LoaderId, "loader_");

/// One instrumented thread of one producer process, `0` is the control pseudo-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(pub u32);

impl ProducerId {
    pub const CONTROL: Self = ProducerId(0);

    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_control() {
            write!(f, "control")
        } else {
            write!(f, "producer_{:04}", self.0)
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Absorb, Emit, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object_{:x}", self.0)
    }
}
