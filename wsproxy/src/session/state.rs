//! Pure transitions over session records. No IO, no clocks: ordering across
//! nodes comes from the replicated log, not from this module.

use crate::session::{FullClientId, Instance, Session, SessionId, UNLIMITED_CONNECTIONS};

/// Outcome of a session operation.
///
/// `Unchanged` is a success with no side effect, never an error: adding an
/// instance that is already registered or removing one that is absent both
/// leave the session as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOpResult {
    /// Successful mutation, carrying the new session value.
    Updated(Session),
    /// Legal no-op, carrying the untouched session value.
    Unchanged(Session),
    /// Add refused: the session is at its connection quota.
    InstanceLimitReached(Session),
    /// A producer instance was offered to a consumer session or vice versa.
    InstanceTypeForSessionIncorrect(Session),
    /// Lookup-style operations only.
    SessionNotFound(SessionId),
    /// Transport or async failure surfaced by the handler.
    IncompleteOp(String),
}

impl SessionOpResult {
    /// True for `Updated` and `Unchanged`: the caller may proceed.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SessionOpResult::Updated(_) | SessionOpResult::Unchanged(_)
        )
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionOpResult::Updated(s)
            | SessionOpResult::Unchanged(s)
            | SessionOpResult::InstanceLimitReached(s)
            | SessionOpResult::InstanceTypeForSessionIncorrect(s) => Some(s),
            _ => None,
        }
    }
}

impl Session {
    /// True when another socket may register right now.
    pub fn can_open_socket(&self) -> bool {
        self.max_connections() == UNLIMITED_CONNECTIONS
            || self.instance_count() < self.max_connections() as usize
    }

    /// Register `instance`, enforcing the type invariant and the connection
    /// quota. Re-adding a registered instance id is a no-op.
    pub fn add_instance(&self, instance: Instance) -> SessionOpResult {
        match (self, instance) {
            (Session::Consumer(session), Instance::Consumer(instance)) => {
                if session.instances.iter().any(|i| i.id == instance.id) {
                    return SessionOpResult::Unchanged(self.clone());
                }
                if !self.can_open_socket() {
                    return SessionOpResult::InstanceLimitReached(self.clone());
                }
                let mut next = session.clone();
                next.instances.push(instance);
                SessionOpResult::Updated(Session::Consumer(next))
            }
            (Session::Producer(session), Instance::Producer(instance)) => {
                if session.instances.iter().any(|i| i.id == instance.id) {
                    return SessionOpResult::Unchanged(self.clone());
                }
                if !self.can_open_socket() {
                    return SessionOpResult::InstanceLimitReached(self.clone());
                }
                let mut next = session.clone();
                next.instances.push(instance);
                SessionOpResult::Updated(Session::Producer(next))
            }
            _ => SessionOpResult::InstanceTypeForSessionIncorrect(self.clone()),
        }
    }

    /// Deregister the instance registered under `id`. Removing an absent
    /// instance is a no-op, which makes socket cleanup idempotent.
    pub fn remove_instance(&self, id: &FullClientId) -> SessionOpResult {
        if !self.contains(id) {
            return SessionOpResult::Unchanged(self.clone());
        }
        match self {
            Session::Consumer(session) => {
                let mut next = session.clone();
                next.instances.retain(|i| FullClientId::Consumer(i.id.clone()) != *id);
                SessionOpResult::Updated(Session::Consumer(next))
            }
            Session::Producer(session) => {
                let mut next = session.clone();
                next.instances.retain(|i| FullClientId::Producer(i.id.clone()) != *id);
                SessionOpResult::Updated(Session::Producer(next))
            }
        }
    }

    /// Non-destructive fold of an `InstanceAdded` log event: the instance is
    /// kept even past the quota so replicas never drop state another node
    /// already acked. Returns the new session and whether this add breached
    /// the quota (the caller reconciles over-quota instances).
    pub(crate) fn apply_instance_added(&self, instance: Instance) -> (Session, bool) {
        match (self, instance) {
            (Session::Consumer(session), Instance::Consumer(instance)) => {
                if session.instances.iter().any(|i| i.id == instance.id) {
                    return (self.clone(), false);
                }
                let over_quota = !self.can_open_socket();
                let mut next = session.clone();
                next.instances.push(instance);
                (Session::Consumer(next), over_quota)
            }
            (Session::Producer(session), Instance::Producer(instance)) => {
                if session.instances.iter().any(|i| i.id == instance.id) {
                    return (self.clone(), false);
                }
                let over_quota = !self.can_open_socket();
                let mut next = session.clone();
                next.instances.push(instance);
                (Session::Producer(next), over_quota)
            }
            // A mixed-kind event can only come from a corrupt log entry;
            // folding ignores it rather than poisoning the replica.
            _ => (self.clone(), false),
        }
    }

    pub(crate) fn apply_instance_removed(&self, id: &FullClientId) -> Session {
        match self.remove_instance(id) {
            SessionOpResult::Updated(next) => next,
            _ => self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        FullConsumerId, FullProducerId, GroupId, Instance, ServerId, SessionKind,
    };

    fn consumer_session(max_connections: u32) -> Session {
        Session::empty(
            SessionKind::Consumer,
            SessionId::from("g1"),
            max_connections,
            Some(GroupId::from("g1")),
        )
    }

    fn consumer(group: &str, client: &str, node: &str) -> Instance {
        Instance::consumer(FullConsumerId::from((group, client)), ServerId::from(node))
    }

    fn added(result: SessionOpResult) -> Session {
        match result {
            SessionOpResult::Updated(s) => s,
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[test]
    fn quota_enforced_at_capacity() {
        // S1: two slots filled from two nodes, the third add is refused.
        let session = consumer_session(2);
        let session = added(session.add_instance(consumer("g1", "c1", "n1")));
        let session = added(session.add_instance(consumer("g1", "c2", "n2")));

        match session.add_instance(consumer("g1", "c3", "n1")) {
            SessionOpResult::InstanceLimitReached(s) => {
                assert_eq!(s.instance_count(), 2);
                assert!(s.contains(&consumer("g1", "c1", "n1").full_id()));
                assert!(s.contains(&consumer("g1", "c2", "n2").full_id()));
            }
            other => panic!("expected InstanceLimitReached, got {other:?}"),
        }
    }

    #[test]
    fn kind_mismatch_leaves_session_untouched() {
        // S2: a producer instance offered to a consumer session.
        let session = Session::empty(
            SessionKind::Consumer,
            SessionId::from("s1"),
            1,
            Some(GroupId::from("s1")),
        );
        let instance = Instance::producer(
            FullProducerId::new("pX", Some(crate::session::InstanceId::from("i1"))),
            ServerId::from("nA"),
        );

        match session.add_instance(instance) {
            SessionOpResult::InstanceTypeForSessionIncorrect(s) => {
                assert_eq!(s.instance_count(), 0);
                assert_eq!(s, session);
            }
            other => panic!("expected InstanceTypeForSessionIncorrect, got {other:?}"),
        }
    }

    #[test]
    fn remove_then_re_add() {
        // S3: a freed slot can be reclaimed, even from another node.
        let session = consumer_session(2);
        let session = added(session.add_instance(consumer("g1", "c1", "n1")));
        let session = added(session.add_instance(consumer("g1", "c2", "n2")));

        let session = added(session.remove_instance(&consumer("g1", "c1", "n1").full_id()));
        assert_eq!(session.instance_count(), 1);
        assert!(session.contains(&consumer("g1", "c2", "n2").full_id()));

        let session = added(session.add_instance(consumer("g1", "c1", "nZ")));
        assert_eq!(session.instance_count(), 2);
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let session = consumer_session(2);
        let session = added(session.add_instance(consumer("g1", "c1", "n1")));

        match session.add_instance(consumer("g1", "c1", "n1")) {
            SessionOpResult::Unchanged(s) => assert_eq!(s, session),
            other => panic!("expected Unchanged, got {other:?}"),
        }
    }

    #[test]
    fn removing_absent_instance_is_a_no_op() {
        let session = consumer_session(2);
        match session.remove_instance(&consumer("g1", "missing", "n1").full_id()) {
            SessionOpResult::Unchanged(s) => assert_eq!(s, session),
            other => panic!("expected Unchanged, got {other:?}"),
        }
    }

    #[test]
    fn remove_is_idempotent() {
        let session = consumer_session(2);
        let session = added(session.add_instance(consumer("g1", "c1", "n1")));
        let id = consumer("g1", "c1", "n1").full_id();

        let once = added(session.remove_instance(&id));
        let mut repeated = once.clone();
        for _ in 0..3 {
            repeated = match repeated.remove_instance(&id) {
                SessionOpResult::Unchanged(s) => s,
                other => panic!("expected Unchanged, got {other:?}"),
            };
        }
        assert_eq!(once, repeated);
    }

    #[test]
    fn zero_max_connections_is_unlimited() {
        let mut session = consumer_session(0);
        for i in 0..32 {
            session = added(session.add_instance(consumer("g1", &format!("c{i}"), "n1")));
            assert!(session.can_open_socket());
        }
        assert_eq!(session.instance_count(), 32);
    }

    #[test]
    fn can_open_socket_tracks_capacity() {
        let session = consumer_session(1);
        assert!(session.can_open_socket());

        let session = added(session.add_instance(consumer("g1", "c1", "n1")));
        assert!(!session.can_open_socket());

        let session = added(session.remove_instance(&consumer("g1", "c1", "n1").full_id()));
        assert!(session.can_open_socket());
    }

    #[test]
    fn quota_holds_over_mixed_op_sequences() {
        let mut session = consumer_session(3);
        for round in 0..10 {
            for i in 0..6 {
                let result =
                    session.add_instance(consumer("g1", &format!("c{round}-{i}"), "n1"));
                if let SessionOpResult::Updated(next) = result {
                    session = next;
                }
                assert!(session.instance_count() <= 3);
            }
            for instance in session.instances() {
                if let SessionOpResult::Updated(next) =
                    session.remove_instance(&instance.full_id())
                {
                    session = next;
                }
            }
            assert_eq!(session.instance_count(), 0);
        }
    }

    #[test]
    fn fold_keeps_over_quota_instances() {
        let session = consumer_session(1);
        let (session, over) = session.apply_instance_added(consumer("g1", "c1", "n1"));
        assert!(!over);
        let (session, over) = session.apply_instance_added(consumer("g1", "c2", "n2"));
        assert!(over);
        assert_eq!(session.instance_count(), 2);

        let session = session.apply_instance_removed(&consumer("g1", "c2", "n2").full_id());
        assert_eq!(session.instance_count(), 1);
    }
}
