//! Query-parameter contracts for the two socket endpoints. Parsed from the
//! raw query string so a missing parameter maps to the JSON 400 body
//! instead of the extractor's plain-text rejection.

use serde::Deserialize;

use crate::api::ProxyError;
use crate::frames::{FormatType, PayloadFormat};
use crate::session::{ClientId, GroupId, InstanceId, ProducerId, TopicName};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProducerQuery {
    client_id: Option<String>,
    instance_id: Option<String>,
    topic: Option<String>,
    key_type: Option<String>,
    val_type: Option<String>,
    socket_payload: Option<String>,
}

/// Parsed `/socket/in` parameters.
#[derive(Debug)]
pub struct ProducerParams {
    pub client_id: ProducerId,
    pub instance_id: Option<InstanceId>,
    pub topic: TopicName,
    /// Absent means the key is passed through as raw bytes.
    pub key_format: Option<FormatType>,
    pub val_format: FormatType,
}

impl ProducerParams {
    pub fn parse(query: &str) -> Result<Self, ProxyError> {
        let raw: RawProducerQuery = serde_urlencoded::from_str(query)
            .map_err(|e| ProxyError::RequestValidation(e.to_string()))?;

        let client_id = required(raw.client_id, "clientId")?;
        let topic = required(raw.topic, "topic")?;
        check_payload_format(raw.socket_payload.as_deref())?;

        Ok(Self {
            client_id: ProducerId::new(client_id),
            instance_id: raw.instance_id.map(InstanceId::new),
            topic: TopicName::new(topic),
            key_format: parse_format(raw.key_type.as_deref())?,
            val_format: parse_format(raw.val_type.as_deref())?.unwrap_or(FormatType::Json),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConsumerQuery {
    client_id: Option<String>,
    group_id: Option<String>,
    topic: Option<String>,
    key_type: Option<String>,
    val_type: Option<String>,
    socket_payload: Option<String>,
    rate: Option<String>,
    batch_size: Option<String>,
    auto_commit: Option<String>,
}

/// Parsed `/socket/out` parameters. `rate`, `batch_size` and `auto_commit`
/// fall back to the configured defaults when absent.
#[derive(Debug)]
pub struct ConsumerParams {
    pub client_id: ClientId,
    pub group_id: GroupId,
    pub topic: TopicName,
    pub key_format: Option<FormatType>,
    pub val_format: FormatType,
    pub rate: Option<u32>,
    pub batch_size: Option<usize>,
    pub auto_commit: Option<bool>,
}

impl ConsumerParams {
    pub fn parse(query: &str) -> Result<Self, ProxyError> {
        let raw: RawConsumerQuery = serde_urlencoded::from_str(query)
            .map_err(|e| ProxyError::RequestValidation(e.to_string()))?;

        let client_id = required(raw.client_id, "clientId")?;
        let group_id = required(raw.group_id, "groupId")?;
        let topic = required(raw.topic, "topic")?;
        check_payload_format(raw.socket_payload.as_deref())?;

        let rate = parse_number::<u32>(raw.rate.as_deref(), "rate")?;
        let batch_size = parse_number::<usize>(raw.batch_size.as_deref(), "batchSize")?;
        if batch_size == Some(0) {
            return Err(ProxyError::RequestValidation(
                "batchSize must be at least 1".to_string(),
            ));
        }
        let auto_commit = match raw.auto_commit.as_deref() {
            None => None,
            Some(value) => Some(value.trim().parse::<bool>().map_err(|_| {
                ProxyError::RequestValidation(format!("invalid autoCommit value: {value}"))
            })?),
        };

        Ok(Self {
            client_id: ClientId::new(client_id),
            group_id: GroupId::new(group_id),
            topic: TopicName::new(topic),
            key_format: parse_format(raw.key_type.as_deref())?,
            val_format: parse_format(raw.val_type.as_deref())?.unwrap_or(FormatType::Json),
            rate,
            batch_size,
            auto_commit,
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ProxyError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ProxyError::MissingParam(name)),
    }
}

fn parse_format(value: Option<&str>) -> Result<Option<FormatType>, ProxyError> {
    value
        .map(|v| v.parse::<FormatType>().map_err(ProxyError::RequestValidation))
        .transpose()
}

/// Avro envelopes need the schema-registry bridge, which this proxy does
/// not speak; the parameter is accepted for compatibility and rejected
/// explicitly.
fn check_payload_format(value: Option<&str>) -> Result<(), ProxyError> {
    match value {
        None => Ok(()),
        Some(value) => match value.parse::<PayloadFormat>() {
            Ok(PayloadFormat::Json) => Ok(()),
            Ok(PayloadFormat::Avro) => Err(ProxyError::RequestValidation(
                "socketPayload avro is not supported, use json".to_string(),
            )),
            Err(e) => Err(ProxyError::RequestValidation(e)),
        },
    }
}

fn parse_number<T: std::str::FromStr>(
    value: Option<&str>,
    name: &'static str,
) -> Result<Option<T>, ProxyError> {
    value
        .map(|v| {
            v.trim().parse::<T>().map_err(|_| {
                ProxyError::RequestValidation(format!("invalid {name} value: {v}"))
            })
        })
        .transpose()
}
