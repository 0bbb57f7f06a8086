use std::fmt;

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod handler;
pub mod log;
pub mod state;

pub use state::SessionOpResult;

/// Opaque string identifiers. Newtypes so a group id can never be passed
/// where a producer id is expected.
macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

identifier!(
    /// Identity of one proxy node in the cluster.
    ServerId
);
identifier!(
    /// Identity of a session bucket: the consumer group id for consumer
    /// sessions, the producer id for producer sessions.
    SessionId
);
identifier!(GroupId);
identifier!(ClientId);
identifier!(ProducerId);
identifier!(InstanceId);
identifier!(TopicName);

/// Globally unique identity of a consumer socket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FullConsumerId {
    pub group_id: GroupId,
    pub client_id: ClientId,
}

impl FullConsumerId {
    pub fn new(group_id: impl Into<GroupId>, client_id: impl Into<ClientId>) -> Self {
        Self {
            group_id: group_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for FullConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.client_id)
    }
}

impl From<(&str, &str)> for FullConsumerId {
    fn from((group_id, client_id): (&str, &str)) -> Self {
        Self::new(GroupId::from(group_id), ClientId::from(client_id))
    }
}

/// Globally unique identity of a producer socket. The instance id
/// distinguishes multiple sockets opened under the same producer id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FullProducerId {
    pub producer_id: ProducerId,
    pub instance_id: Option<InstanceId>,
}

impl FullProducerId {
    pub fn new(producer_id: impl Into<ProducerId>, instance_id: Option<InstanceId>) -> Self {
        Self {
            producer_id: producer_id.into(),
            instance_id,
        }
    }
}

impl fmt::Display for FullProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance_id {
            Some(instance_id) => write!(f, "{}/{}", self.producer_id, instance_id),
            None => f.write_str(self.producer_id.as_str()),
        }
    }
}

/// Identity of any socket, consumer or producer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FullClientId {
    Consumer(FullConsumerId),
    Producer(FullProducerId),
}

impl fmt::Display for FullClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FullClientId::Consumer(id) => write!(f, "consumer:{id}"),
            FullClientId::Producer(id) => write!(f, "producer:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Consumer,
    Producer,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Consumer => f.write_str("consumer"),
            SessionKind::Producer => f.write_str("producer"),
        }
    }
}

/// One live consumer socket's registration, tagged with the hosting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInstance {
    pub id: FullConsumerId,
    pub server_id: ServerId,
}

/// One live producer socket's registration, tagged with the hosting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInstance {
    pub id: FullProducerId,
    pub server_id: ServerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instance {
    Consumer(ConsumerInstance),
    Producer(ProducerInstance),
}

impl Instance {
    pub fn consumer(id: FullConsumerId, server_id: ServerId) -> Self {
        Instance::Consumer(ConsumerInstance { id, server_id })
    }

    pub fn producer(id: FullProducerId, server_id: ServerId) -> Self {
        Instance::Producer(ProducerInstance { id, server_id })
    }

    pub fn full_id(&self) -> FullClientId {
        match self {
            Instance::Consumer(i) => FullClientId::Consumer(i.id.clone()),
            Instance::Producer(i) => FullClientId::Producer(i.id.clone()),
        }
    }

    pub fn server_id(&self) -> &ServerId {
        match self {
            Instance::Consumer(i) => &i.server_id,
            Instance::Producer(i) => &i.server_id,
        }
    }
}

/// Sessions allowing any number of concurrent sockets use this sentinel.
pub const UNLIMITED_CONNECTIONS: u32 = 0;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1;

/// A bucket of consumer sockets sharing one consumer group.
///
/// Immutable value object: mutating operations live on [`Session`] and
/// return fresh values. The instance list is an insertion-ordered set keyed
/// by [`FullConsumerId`]; the typed list makes a producer instance inside a
/// consumer session unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSession {
    pub(crate) session_id: SessionId,
    pub(crate) group_id: GroupId,
    pub(crate) max_connections: u32,
    #[serde(default)]
    pub(crate) instances: Vec<ConsumerInstance>,
}

impl ConsumerSession {
    pub fn new(
        session_id: impl Into<SessionId>,
        group_id: impl Into<GroupId>,
        max_connections: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            group_id: group_id.into(),
            max_connections,
            instances: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }
}

/// A bucket of producer sockets sharing one producer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerSession {
    pub(crate) session_id: SessionId,
    pub(crate) max_connections: u32,
    #[serde(default)]
    pub(crate) instances: Vec<ProducerInstance>,
}

impl ProducerSession {
    pub fn new(session_id: impl Into<SessionId>, max_connections: u32) -> Self {
        Self {
            session_id: session_id.into(),
            max_connections,
            instances: Vec::new(),
        }
    }
}

/// The central entity of the registry: the unit of connection quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Session {
    Consumer(ConsumerSession),
    Producer(ProducerSession),
}

impl Session {
    /// Synthesize a fresh, empty session of the requested kind. For
    /// consumer sessions the group id defaults to the session id when not
    /// given, matching how consumer session ids are derived.
    pub fn empty(
        kind: SessionKind,
        session_id: SessionId,
        max_connections: u32,
        group_id: Option<GroupId>,
    ) -> Self {
        match kind {
            SessionKind::Consumer => {
                let group_id =
                    group_id.unwrap_or_else(|| GroupId::new(session_id.as_str().to_string()));
                Session::Consumer(ConsumerSession::new(session_id, group_id, max_connections))
            }
            SessionKind::Producer => {
                Session::Producer(ProducerSession::new(session_id, max_connections))
            }
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Session::Consumer(s) => &s.session_id,
            Session::Producer(s) => &s.session_id,
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            Session::Consumer(_) => SessionKind::Consumer,
            Session::Producer(_) => SessionKind::Producer,
        }
    }

    pub fn max_connections(&self) -> u32 {
        match self {
            Session::Consumer(s) => s.max_connections,
            Session::Producer(s) => s.max_connections,
        }
    }

    pub fn instance_count(&self) -> usize {
        match self {
            Session::Consumer(s) => s.instances.len(),
            Session::Producer(s) => s.instances.len(),
        }
    }

    pub fn instances(&self) -> Vec<Instance> {
        match self {
            Session::Consumer(s) => s.instances.iter().cloned().map(Instance::Consumer).collect(),
            Session::Producer(s) => s.instances.iter().cloned().map(Instance::Producer).collect(),
        }
    }

    pub fn contains(&self, id: &FullClientId) -> bool {
        match (self, id) {
            (Session::Consumer(s), FullClientId::Consumer(id)) => {
                s.instances.iter().any(|i| &i.id == id)
            }
            (Session::Producer(s), FullClientId::Producer(id)) => {
                s.instances.iter().any(|i| &i.id == id)
            }
            _ => false,
        }
    }

    /// The instance hosted for `id`, if registered.
    pub fn instance_for(&self, id: &FullClientId) -> Option<Instance> {
        match (self, id) {
            (Session::Consumer(s), FullClientId::Consumer(id)) => s
                .instances
                .iter()
                .find(|i| &i.id == id)
                .cloned()
                .map(Instance::Consumer),
            (Session::Producer(s), FullClientId::Producer(id)) => s
                .instances
                .iter()
                .find(|i| &i.id == id)
                .cloned()
                .map(Instance::Producer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_equality_is_structural() {
        let a = Session::empty(
            SessionKind::Consumer,
            SessionId::from("g1"),
            2,
            Some(GroupId::from("g1")),
        );
        let b = Session::empty(
            SessionKind::Consumer,
            SessionId::from("g1"),
            2,
            Some(GroupId::from("g1")),
        );
        assert_eq!(a, b);
        assert_ne!(
            a,
            Session::empty(SessionKind::Producer, SessionId::from("g1"), 2, None)
        );
    }

    #[test]
    fn consumer_group_defaults_to_session_id() {
        let session = Session::empty(SessionKind::Consumer, SessionId::from("orders"), 1, None);
        let Session::Consumer(inner) = session else {
            panic!("expected a consumer session");
        };
        assert_eq!(inner.group_id(), &GroupId::from("orders"));
    }

    #[test]
    fn contains_distinguishes_kinds() {
        let mut session = ConsumerSession::new("g1", "g1", 2);
        session.instances.push(ConsumerInstance {
            id: FullConsumerId::from(("g1", "c1")),
            server_id: ServerId::from("n1"),
        });
        let session = Session::Consumer(session);

        assert!(session.contains(&FullClientId::Consumer(FullConsumerId::from(("g1", "c1")))));
        assert!(!session.contains(&FullClientId::Producer(FullProducerId::new("g1", None))));
    }
}
