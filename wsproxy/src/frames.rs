//! WebSocket frame payloads and the per-socket key/value codecs.
//!
//! Frames are JSON envelopes; the proxy only understands them deeply enough
//! to route bytes to and from Kafka and to correlate acknowledgements.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::TopicName;

/// Identifies one delivered record: what a consumer acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessageId {
    pub topic: TopicName,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub key: String,
    pub value: String,
}

/// Inbound frame on a producer socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProducerFrame {
    #[serde(default)]
    pub key: Option<Value>,
    pub value: Value,
    #[serde(default)]
    pub headers: Vec<RecordHeader>,
    /// Client-side correlation id, echoed back in the ack.
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Ack sent back once the broker accepted a produced record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAck {
    pub topic: TopicName,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Outbound frame on a consumer socket: one delivered record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFrame {
    pub ws_message_id: WsMessageId,
    pub topic: TopicName,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<RecordHeader>,
}

/// Inbound frame on a consumer socket: the client acknowledges a record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub ws_message_id: WsMessageId,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{format} value expected, got: {got}")]
    TypeMismatch { format: FormatType, got: String },
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("{0} byte payload does not fit format {1}")]
    Width(usize, FormatType),
}

/// Key/value serdes negotiated per socket from the `keyType`/`valType`
/// query parameters. `Bytes` carries base64 over the WebSocket and raw
/// bytes on the Kafka side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatType {
    String,
    Json,
    Bytes,
    Int,
    Long,
}

impl std::fmt::Display for FormatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FormatType::String => "string",
            FormatType::Json => "json",
            FormatType::Bytes => "bytes",
            FormatType::Int => "int",
            FormatType::Long => "long",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for FormatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "string" => Ok(FormatType::String),
            "json" => Ok(FormatType::Json),
            "bytes" | "bytearray" => Ok(FormatType::Bytes),
            "int" => Ok(FormatType::Int),
            "long" => Ok(FormatType::Long),
            other => Err(format!("unknown format type: {other}")),
        }
    }
}

impl FormatType {
    /// Frame JSON value -> Kafka record bytes.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, FrameError> {
        match self {
            FormatType::String => match value {
                Value::String(s) => Ok(s.clone().into_bytes()),
                other => Err(self.mismatch(other)),
            },
            FormatType::Json => serde_json::to_vec(value).map_err(FrameError::Malformed),
            FormatType::Bytes => match value {
                Value::String(s) => Ok(BASE64_STANDARD.decode(s)?),
                other => Err(self.mismatch(other)),
            },
            FormatType::Int => match value.as_i64() {
                Some(n) if i32::try_from(n).is_ok() => Ok((n as i32).to_be_bytes().to_vec()),
                _ => Err(self.mismatch(value)),
            },
            FormatType::Long => match value.as_i64() {
                Some(n) => Ok(n.to_be_bytes().to_vec()),
                None => Err(self.mismatch(value)),
            },
        }
    }

    /// Kafka record bytes -> frame JSON value.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, FrameError> {
        match self {
            FormatType::String => std::str::from_utf8(bytes)
                .map(|s| Value::String(s.to_string()))
                .map_err(|_| FrameError::Utf8),
            FormatType::Json => serde_json::from_slice(bytes).map_err(FrameError::Malformed),
            FormatType::Bytes => Ok(Value::String(BASE64_STANDARD.encode(bytes))),
            FormatType::Int => {
                let bytes: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| FrameError::Width(bytes.len(), *self))?;
                Ok(Value::from(i32::from_be_bytes(bytes)))
            }
            FormatType::Long => {
                let bytes: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| FrameError::Width(bytes.len(), *self))?;
                Ok(Value::from(i64::from_be_bytes(bytes)))
            }
        }
    }

    fn mismatch(&self, got: &Value) -> FrameError {
        FrameError::TypeMismatch {
            format: *self,
            got: got.to_string(),
        }
    }
}

/// Envelope encoding negotiated via `socketPayload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Avro,
}

impl std::str::FromStr for PayloadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "json" => Ok(PayloadFormat::Json),
            "avro" => Ok(PayloadFormat::Avro),
            other => Err(format!("unknown socket payload format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;

    #[test]
    fn string_and_json_formats_round_trip() {
        let value = Value::String("hello".to_string());
        let bytes = FormatType::String.encode(&value).expect("encode");
        assert_eq!(bytes, b"hello");
        assert_eq!(FormatType::String.decode(&bytes).expect("decode"), value);

        let value = serde_json::json!({"a": [1, 2], "b": null});
        let bytes = FormatType::Json.encode(&value).expect("encode");
        assert_eq!(FormatType::Json.decode(&bytes).expect("decode"), value);
    }

    #[test]
    fn bytes_format_uses_base64_on_the_wire() {
        let raw = vec![0u8, 159, 146, 150];
        let framed = FormatType::Bytes.decode(&raw).expect("decode");
        let bytes = FormatType::Bytes.encode(&framed).expect("encode");
        assert_eq!(bytes, raw);

        assert!(FormatType::Bytes
            .encode(&Value::String("not base64!!".to_string()))
            .is_err());
    }

    #[test]
    fn numeric_formats_are_big_endian_fixed_width() {
        let bytes = FormatType::Int.encode(&Value::from(1)).expect("encode");
        assert_eq!(bytes, vec![0, 0, 0, 1]);
        assert_eq!(
            FormatType::Long
                .encode(&Value::from(-1))
                .expect("encode")
                .len(),
            8
        );

        assert!(FormatType::Int.encode(&Value::from(i64::MAX)).is_err());
        assert!(FormatType::Int.decode(&[1, 2]).is_err());
        assert_eq!(
            FormatType::Long.decode(&42i64.to_be_bytes()).expect("decode"),
            Value::from(42)
        );
    }

    #[test]
    fn producer_frame_accepts_minimal_payload() {
        let frame: ProducerFrame =
            serde_json::from_str(r#"{"value": "v1"}"#).expect("parse frame");
        assert_eq!(frame.value, Value::String("v1".to_string()));
        assert!(frame.key.is_none());
        assert!(frame.headers.is_empty());

        assert!(serde_json::from_str::<ProducerFrame>(r#"{"value": 1, "bogus": 2}"#).is_err());
    }

    #[test]
    fn delivery_frame_wire_shape() {
        let frame = DeliveryFrame {
            ws_message_id: WsMessageId {
                topic: TopicName::from("orders"),
                partition: 0,
                offset: 12,
                timestamp: 1_700_000_000_000,
            },
            topic: TopicName::from("orders"),
            partition: 0,
            offset: 12,
            timestamp: 1_700_000_000_000,
            key: None,
            value: Value::String("v".to_string()),
            headers: vec![],
        };
        assert_json_eq!(
            serde_json::to_value(&frame).expect("serialize"),
            serde_json::json!({
                "wsMessageId": {
                    "topic": "orders",
                    "partition": 0,
                    "offset": 12,
                    "timestamp": 1_700_000_000_000_i64
                },
                "topic": "orders",
                "partition": 0,
                "offset": 12,
                "timestamp": 1_700_000_000_000_i64,
                "value": "v"
            })
        );
    }

    #[test]
    fn ack_frame_round_trips() {
        let ack = AckFrame {
            ws_message_id: WsMessageId {
                topic: TopicName::from("orders"),
                partition: 3,
                offset: 9,
                timestamp: 1,
            },
        };
        let wire = serde_json::to_string(&ack).expect("serialize");
        assert_eq!(
            serde_json::from_str::<AckFrame>(&wire).expect("parse"),
            ack
        );
    }
}
