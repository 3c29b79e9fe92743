//! Fixed binary wire format for [`NodeTelemetry`].
//!
//! Records travel as protobuf messages with exactly four fields:
//!
//! ```text
//! message NodeTelemetry {
//!   optional string node_id     = 1;
//!   optional int64  timestamp   = 2;
//!   optional float  temperature = 3;
//!   optional float  humidity    = 4;
//! }
//! ```
//!
//! Every field is always written, in tag order, so identical values produce
//! byte-identical payloads. Decoding is strict: a buffer is accepted only if
//! it is exactly the encoding of the record it decodes to.

use prost::Message;
use thiserror::Error;

use crate::telemetry::NodeTelemetry;

/// Reasons a payload is rejected by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    /// Truncated buffer, bad varint, bad length prefix or wrong wire type.
    #[error("invalid wire data: {0}")]
    Wire(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("empty node id")]
    EmptyNodeId,

    /// Unknown, repeated or padded fields.
    #[error("unexpected field layout: {actual} bytes, canonical encoding is {expected} bytes")]
    FieldLayout { expected: usize, actual: usize },

    /// Right fields and length, but not in the canonical order or form.
    #[error("non-canonical encoding")]
    NonCanonical,
}

impl From<prost::DecodeError> for MalformedRecord {
    fn from(e: prost::DecodeError) -> Self {
        MalformedRecord::Wire(e.to_string())
    }
}

#[derive(Clone, PartialEq, Message)]
struct WireRecord {
    #[prost(string, optional, tag = "1")]
    node_id: Option<String>,

    #[prost(int64, optional, tag = "2")]
    timestamp: Option<i64>,

    #[prost(float, optional, tag = "3")]
    temperature: Option<f32>,

    #[prost(float, optional, tag = "4")]
    humidity: Option<f32>,
}

impl From<&NodeTelemetry> for WireRecord {
    fn from(t: &NodeTelemetry) -> Self {
        Self {
            node_id: Some(t.node_id.clone()),
            timestamp: Some(t.timestamp),
            temperature: Some(t.temperature),
            humidity: Some(t.humidity),
        }
    }
}

impl TryFrom<WireRecord> for NodeTelemetry {
    type Error = MalformedRecord;

    fn try_from(w: WireRecord) -> Result<Self, Self::Error> {
        let node_id = w.node_id.ok_or(MalformedRecord::MissingField("node_id"))?;
        if node_id.is_empty() {
            return Err(MalformedRecord::EmptyNodeId);
        }

        Ok(NodeTelemetry {
            node_id,
            timestamp: w.timestamp.ok_or(MalformedRecord::MissingField("timestamp"))?,
            temperature: w
                .temperature
                .ok_or(MalformedRecord::MissingField("temperature"))?,
            humidity: w.humidity.ok_or(MalformedRecord::MissingField("humidity"))?,
        })
    }
}

/// Encode a record to its wire form.
pub fn encode(record: &NodeTelemetry) -> Vec<u8> {
    WireRecord::from(record).encode_to_vec()
}

/// Decode a record from its wire form.
pub fn decode(data: &[u8]) -> Result<NodeTelemetry, MalformedRecord> {
    let wire = WireRecord::decode(data)?;

    let expected = wire.encoded_len();
    if expected != data.len() {
        return Err(MalformedRecord::FieldLayout {
            expected,
            actual: data.len(),
        });
    }

    let record = NodeTelemetry::try_from(wire)?;
    if encode(&record) != data {
        return Err(MalformedRecord::NonCanonical);
    }

    Ok(record)
}
