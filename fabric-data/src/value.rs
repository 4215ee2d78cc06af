//! The self-describing tagged value carried in reports, writes and invokes.

use serde::{Deserialize, Serialize};

/// A self-describing tagged value.
///
/// `DataValue` mirrors the wire encoding one-to-one so that a value decoded
/// from a report, cached, persisted and re-encoded comes back bit-identical.
/// Structures are ordered sequences of `(field id, value)` pairs; arrays are
/// ordered sequences of items.
///
/// Equality is canonical: two values are equal when their type tags match
/// and their payloads match, with `Null == Null` and floats compared by bit
/// pattern (so `NaN` round-trips and the type can be `Eq`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataValue {
    UnsignedInt(u64),
    SignedInt(i64),
    Boolean(bool),
    Utf8(String),
    Octets(Vec<u8>),
    Float(f32),
    Double(f64),
    Null,
    Structure(Vec<(u32, DataValue)>),
    Array(Vec<DataValue>),
}

impl DataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    /// The type tag name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::UnsignedInt(_) => "unsigned-int",
            DataValue::SignedInt(_) => "signed-int",
            DataValue::Boolean(_) => "boolean",
            DataValue::Utf8(_) => "utf8",
            DataValue::Octets(_) => "octets",
            DataValue::Float(_) => "float",
            DataValue::Double(_) => "double",
            DataValue::Null => "null",
            DataValue::Structure(_) => "structure",
            DataValue::Array(_) => "array",
        }
    }

    /// Interpret an unsigned-int value as an endpoint id, if it fits.
    pub fn as_endpoint_id(&self) -> Option<u16> {
        match self {
            DataValue::UnsignedInt(v) => u16::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Borrow the items of an array value.
    pub fn as_array(&self) -> Option<&[DataValue]> {
        match self {
            DataValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl PartialEq for DataValue {
    fn eq(&self, other: &Self) -> bool {
        use DataValue::*;
        match (self, other) {
            (UnsignedInt(a), UnsignedInt(b)) => a == b,
            (SignedInt(a), SignedInt(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            (Utf8(a), Utf8(b)) => a == b,
            (Octets(a), Octets(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Null, Null) => true,
            (Structure(a), Structure(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for DataValue {}
