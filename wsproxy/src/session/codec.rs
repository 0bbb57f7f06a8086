//! Wire format for the session-state topic.
//!
//! Records are JSON envelopes keyed by session id so topic compaction keeps
//! the latest state per session. Decoding ignores unknown fields, letting
//! newer nodes add fields without breaking older readers; undecodable
//! records are surfaced as errors for the reader to skip and log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{FullClientId, GroupId, Instance, ServerId, Session, SessionId, SessionKind};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode session event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode session event: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A session change, as replicated between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated {
        session_id: SessionId,
        kind: SessionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        max_connections: u32,
    },
    InstanceAdded {
        session_id: SessionId,
        instance: Instance,
    },
    InstanceRemoved {
        session_id: SessionId,
        instance_id: FullClientId,
    },
    SessionRemoved {
        session_id: SessionId,
    },
    /// Full state, interpreted as a wholesale replacement. Emitted
    /// periodically so a compacted log stays reconstructible.
    SessionSnapshot {
        session: Session,
    },
}

impl SessionEvent {
    /// The compaction key: events for one session always share a key.
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::SessionCreated { session_id, .. }
            | SessionEvent::InstanceAdded { session_id, .. }
            | SessionEvent::InstanceRemoved { session_id, .. }
            | SessionEvent::SessionRemoved { session_id } => session_id,
            SessionEvent::SessionSnapshot { session } => session.session_id(),
        }
    }
}

/// Envelope around [`SessionEvent`] carrying the emitting node and its
/// per-node monotonic sequence number, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStateRecord {
    pub server_id: ServerId,
    pub sequence: u64,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl SessionStateRecord {
    pub fn key(&self) -> &str {
        self.event.session_id().as_str()
    }
}

pub fn encode(record: &SessionStateRecord) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(record).map_err(CodecError::Encode)
}

pub fn decode(payload: &[u8]) -> Result<SessionStateRecord, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FullConsumerId, FullProducerId, SessionOpResult};
    use assert_json_diff::assert_json_include;

    fn record(event: SessionEvent) -> SessionStateRecord {
        SessionStateRecord {
            server_id: ServerId::from("n1"),
            sequence: 7,
            event,
        }
    }

    fn round_trip(event: SessionEvent) {
        let original = record(event);
        let bytes = encode(&original).expect("encode failed");
        let decoded = decode(&bytes).expect("decode failed");
        assert_eq!(decoded, original);
    }

    #[test]
    fn round_trips_every_event_kind() {
        round_trip(SessionEvent::SessionCreated {
            session_id: SessionId::from("g1"),
            kind: SessionKind::Consumer,
            group_id: Some(GroupId::from("g1")),
            max_connections: 2,
        });
        round_trip(SessionEvent::SessionCreated {
            session_id: SessionId::from("p1"),
            kind: SessionKind::Producer,
            group_id: None,
            max_connections: 1,
        });
        round_trip(SessionEvent::InstanceAdded {
            session_id: SessionId::from("g1"),
            instance: Instance::consumer(
                FullConsumerId::from(("g1", "c1")),
                ServerId::from("n1"),
            ),
        });
        round_trip(SessionEvent::InstanceRemoved {
            session_id: SessionId::from("p1"),
            instance_id: FullClientId::Producer(FullProducerId::new("p1", None)),
        });
        round_trip(SessionEvent::SessionRemoved {
            session_id: SessionId::from("g1"),
        });

        let session = crate::session::Session::empty(
            SessionKind::Consumer,
            SessionId::from("g1"),
            2,
            None,
        );
        let session = match session.add_instance(Instance::consumer(
            FullConsumerId::from(("g1", "c1")),
            ServerId::from("n1"),
        )) {
            SessionOpResult::Updated(s) => s,
            other => panic!("expected Updated, got {other:?}"),
        };
        round_trip(SessionEvent::SessionSnapshot { session });
    }

    #[test]
    fn key_is_the_session_id() {
        let rec = record(SessionEvent::SessionRemoved {
            session_id: SessionId::from("g1"),
        });
        assert_eq!(rec.key(), "g1");

        let rec = record(SessionEvent::SessionSnapshot {
            session: Session::empty(SessionKind::Producer, SessionId::from("p9"), 1, None),
        });
        assert_eq!(rec.key(), "p9");
    }

    #[test]
    fn unknown_fields_are_ignored_on_read() {
        let wire = serde_json::json!({
            "server_id": "n2",
            "sequence": 41,
            "type": "instance_removed",
            "session_id": "g1",
            "instance_id": {"kind": "consumer", "group_id": "g1", "client_id": "c1"},
            "emitted_at_ms": 1_700_000_000_000_i64,
            "reason": "compensation"
        });
        let decoded = decode(wire.to_string().as_bytes()).expect("decode failed");
        assert_eq!(decoded.server_id, ServerId::from("n2"));
        assert_eq!(decoded.sequence, 41);
        assert_eq!(
            decoded.event,
            SessionEvent::InstanceRemoved {
                session_id: SessionId::from("g1"),
                instance_id: FullClientId::Consumer(FullConsumerId::from(("g1", "c1"))),
            }
        );
    }

    #[test]
    fn wire_shape_is_stable() {
        let rec = record(SessionEvent::SessionCreated {
            session_id: SessionId::from("g1"),
            kind: SessionKind::Consumer,
            group_id: Some(GroupId::from("g1")),
            max_connections: 2,
        });
        let value: serde_json::Value =
            serde_json::from_slice(&encode(&rec).expect("encode failed")).expect("json");
        assert_json_include!(
            actual: value,
            expected: serde_json::json!({
                "server_id": "n1",
                "sequence": 7,
                "type": "session_created",
                "session_id": "g1",
                "kind": "consumer",
                "group_id": "g1",
                "max_connections": 2
            })
        );
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode(b"not json").is_err());
        assert!(decode(br#"{"type": "who_knows", "server_id": "n1", "sequence": 1}"#).is_err());
    }
}
