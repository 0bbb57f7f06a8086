//! The cluster-wide session registry.
//!
//! One handler instance per proxy process, running as a single-writer actor:
//! a spawned task exclusively owns the in-memory `SessionId -> Session` map
//! and serializes every mutation through its mailbox. Socket handlers talk
//! to it only through [`SessionHandler`], an async request/response handle.
//!
//! Two coupled flows meet in the actor loop:
//!
//! * the consumer flow folds records from the session-state log into the
//!   map (this is the authoritative ordering), and
//! * the producer flow runs mutation RPCs: pre-check against the current
//!   map, publish the event, then reply once the record comes back through
//!   the log so the response reflects the log-ordered outcome.
//!
//! Replying on consume (rather than optimistically) means a lost
//! capacity race is detected exactly when our record folds: the losing add
//! is kept over-quota, a compensating `InstanceRemoved` is emitted for it,
//! and the caller sees `InstanceLimitReached` instead of a socket that
//! would be evicted moments later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::session::codec::{SessionEvent, SessionStateRecord};
use crate::session::log::{LogEntry, PartitionEnd, SessionLog, SessionLogError};
use crate::session::state::SessionOpResult;
use crate::session::{
    FullClientId, FullConsumerId, FullProducerId, GroupId, Instance, ServerId, Session,
    SessionId, SessionKind,
};

const MAILBOX_DEPTH: usize = 128;
const EVICTION_CHANNEL_DEPTH: usize = 64;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_SNAPSHOT_INTERVAL: u32 = 64;

/// An instance the cluster decided must go: the hosting node closes the
/// matching socket when it observes this.
#[derive(Debug, Clone)]
pub struct Eviction {
    pub session_id: SessionId,
    pub instance_id: FullClientId,
}

#[derive(Clone)]
pub struct SessionHandlerOptions {
    pub rpc_timeout: Duration,
    pub snapshot_interval: u32,
    pub liveness: Option<crate::health::HealthHandle>,
}

impl Default for SessionHandlerOptions {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            liveness: None,
        }
    }
}

enum SessionCmd {
    Init {
        session_id: SessionId,
        kind: SessionKind,
        max_connections: u32,
        group_id: Option<GroupId>,
        reply: oneshot::Sender<SessionOpResult>,
    },
    Add {
        instance: Instance,
        reply: oneshot::Sender<SessionOpResult>,
    },
    Remove {
        instance_id: FullClientId,
        server_id: ServerId,
        reply: oneshot::Sender<SessionOpResult>,
    },
    Get {
        session_id: SessionId,
        reply: oneshot::Sender<SessionOpResult>,
    },
    WaitCaughtUpTo {
        targets: Vec<PartitionEnd>,
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to the registry actor.
#[derive(Clone)]
pub struct SessionHandler {
    tx: mpsc::Sender<SessionCmd>,
    log: Arc<dyn SessionLog>,
    evictions: broadcast::Sender<Eviction>,
    server_id: ServerId,
    rpc_timeout: Duration,
}

impl SessionHandler {
    /// Spawn the actor and its log reader. The map starts empty and
    /// converges as the reader replays the log from the earliest offset;
    /// call [`await_up_to`](Self::await_up_to) for the startup barrier.
    pub fn spawn(
        server_id: ServerId,
        log: Arc<dyn SessionLog>,
        options: SessionHandlerOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let (evictions, _) = broadcast::channel(EVICTION_CHANNEL_DEPTH);
        let entries = log.subscribe();

        let actor = Actor {
            server_id: server_id.clone(),
            log: log.clone(),
            evictions: evictions.clone(),
            sessions: HashMap::new(),
            positions: HashMap::new(),
            pending: HashMap::new(),
            waiters: Vec::new(),
            sequence: initial_sequence(),
            snapshot_interval: options.snapshot_interval.max(1),
            mutations_since_snapshot: HashMap::new(),
            liveness: options.liveness,
        };
        tokio::spawn(actor.run(rx, entries));

        Self {
            tx,
            log,
            evictions,
            server_id,
            rpc_timeout: options.rpc_timeout,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Evictions for instances hosted on this node. Socket tasks filter on
    /// their own client id.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<Eviction> {
        self.evictions.subscribe()
    }

    pub async fn init_session(
        &self,
        session_id: SessionId,
        kind: SessionKind,
        max_connections: u32,
        group_id: Option<GroupId>,
    ) -> SessionOpResult {
        self.call(|reply| SessionCmd::Init {
            session_id,
            kind,
            max_connections,
            group_id,
            reply,
        })
        .await
    }

    pub async fn add_consumer(&self, id: FullConsumerId, server_id: ServerId) -> SessionOpResult {
        self.call(|reply| SessionCmd::Add {
            instance: Instance::consumer(id, server_id),
            reply,
        })
        .await
    }

    pub async fn add_producer(&self, id: FullProducerId, server_id: ServerId) -> SessionOpResult {
        self.call(|reply| SessionCmd::Add {
            instance: Instance::producer(id, server_id),
            reply,
        })
        .await
    }

    pub async fn remove_consumer(&self, id: FullConsumerId, server_id: ServerId) -> SessionOpResult {
        self.call(|reply| SessionCmd::Remove {
            instance_id: FullClientId::Consumer(id),
            server_id,
            reply,
        })
        .await
    }

    pub async fn remove_producer(&self, id: FullProducerId, server_id: ServerId) -> SessionOpResult {
        self.call(|reply| SessionCmd::Remove {
            instance_id: FullClientId::Producer(id),
            server_id,
            reply,
        })
        .await
    }

    pub async fn session_for(&self, session_id: SessionId) -> SessionOpResult {
        self.call(|reply| SessionCmd::Get { session_id, reply }).await
    }

    /// Wait until the local view has consumed up to the end of the log as
    /// observed when this call starts. Used as the one-time startup barrier
    /// and by tests that need a settled view.
    pub async fn await_up_to(&self, wait: Duration) -> Result<(), SessionLogError> {
        timeout(wait, async {
            let targets = self.log.end_offsets().await?;
            let (reply, done) = oneshot::channel();
            self.tx
                .send(SessionCmd::WaitCaughtUpTo { targets, reply })
                .await
                .map_err(|_| SessionLogError::Unavailable("session handler stopped".into()))?;
            done.await
                .map_err(|_| SessionLogError::Unavailable("session handler stopped".into()))
        })
        .await
        .map_err(|_| SessionLogError::Unavailable("catch-up timed out".into()))?
    }

    async fn call(
        &self,
        build: impl FnOnce(oneshot::Sender<SessionOpResult>) -> SessionCmd,
    ) -> SessionOpResult {
        let (reply, response) = oneshot::channel();
        if self.tx.send(build(reply)).await.is_err() {
            return SessionOpResult::IncompleteOp("session handler stopped".to_string());
        }
        match timeout(self.rpc_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                SessionOpResult::IncompleteOp("session handler dropped the request".to_string())
            }
            Err(_) => {
                counter!("wsproxy_session_rpc_timeouts_total").increment(1);
                // The op may still land on the log; cleanup paths tolerate
                // both outcomes.
                SessionOpResult::IncompleteOp("session request timed out".to_string())
            }
        }
    }
}

/// A mutation we published and are waiting to see back from the log.
struct PendingReply {
    reply: oneshot::Sender<SessionOpResult>,
}

struct Actor {
    server_id: ServerId,
    log: Arc<dyn SessionLog>,
    evictions: broadcast::Sender<Eviction>,
    sessions: HashMap<SessionId, Session>,
    /// Next-to-consume offset per log partition.
    positions: HashMap<i32, i64>,
    /// Keyed by our own record sequence number.
    pending: HashMap<u64, PendingReply>,
    waiters: Vec<(Vec<PartitionEnd>, oneshot::Sender<()>)>,
    sequence: u64,
    snapshot_interval: u32,
    mutations_since_snapshot: HashMap<SessionId, u32>,
    liveness: Option<crate::health::HealthHandle>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCmd>,
        mut entries: mpsc::Receiver<LogEntry>,
    ) {
        info!(server_id = %self.server_id, "session handler started");
        let mut heartbeat = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                // Folding log entries first keeps catch-up latency bounded
                // under RPC load.
                biased;
                Some(entry) = entries.recv() => self.fold(entry).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy();
                    }
                }
            }
        }
        debug!(server_id = %self.server_id, "session handler stopped");
    }

    // -- producer flow: mutation RPCs ------------------------------------

    async fn handle(&mut self, command: SessionCmd) {
        match command {
            SessionCmd::Init {
                session_id,
                kind,
                max_connections,
                group_id,
                reply,
            } => {
                if let Some(existing) = self.sessions.get(&session_id) {
                    let result = if existing.kind() == kind {
                        SessionOpResult::Unchanged(existing.clone())
                    } else {
                        SessionOpResult::InstanceTypeForSessionIncorrect(existing.clone())
                    };
                    drop(reply.send(result));
                    return;
                }
                self.publish_then_reply(
                    SessionEvent::SessionCreated {
                        session_id,
                        kind,
                        group_id,
                        max_connections,
                    },
                    reply,
                )
                .await;
            }

            SessionCmd::Add { instance, reply } => {
                let session_id = session_id_of(&instance.full_id());
                let Some(session) = self.sessions.get(&session_id) else {
                    drop(reply.send(SessionOpResult::SessionNotFound(session_id)));
                    return;
                };
                match session.add_instance(instance.clone()) {
                    SessionOpResult::Updated(_) => {
                        self.publish_then_reply(
                            SessionEvent::InstanceAdded {
                                session_id,
                                instance,
                            },
                            reply,
                        )
                        .await;
                    }
                    rejected => {
                        // Rejections never touch the log.
                        drop(reply.send(rejected));
                    }
                }
            }

            SessionCmd::Remove {
                instance_id,
                server_id,
                reply,
            } => {
                let session_id = session_id_of(&instance_id);
                let Some(session) = self.sessions.get(&session_id) else {
                    drop(reply.send(SessionOpResult::SessionNotFound(session_id)));
                    return;
                };
                if let Some(registered) = session.instance_for(&instance_id) {
                    if registered.server_id() != &server_id {
                        warn!(
                            instance = %instance_id,
                            registered = %registered.server_id(),
                            caller = %server_id,
                            "removal requested by a node that does not host the instance"
                        );
                    }
                }
                match session.remove_instance(&instance_id) {
                    SessionOpResult::Updated(_) => {
                        self.publish_then_reply(
                            SessionEvent::InstanceRemoved {
                                session_id,
                                instance_id,
                            },
                            reply,
                        )
                        .await;
                    }
                    unchanged => {
                        drop(reply.send(unchanged));
                    }
                }
            }

            SessionCmd::Get { session_id, reply } => {
                let result = match self.sessions.get(&session_id) {
                    Some(session) => SessionOpResult::Unchanged(session.clone()),
                    None => SessionOpResult::SessionNotFound(session_id),
                };
                drop(reply.send(result));
            }

            SessionCmd::WaitCaughtUpTo { targets, reply } => {
                if self.caught_up_to(&targets) {
                    let _ = reply.send(());
                } else {
                    self.waiters.push((targets, reply));
                }
            }
        }
    }

    /// Publish a mutation and defer the reply until the record folds back
    /// through the log, so the caller sees the log-ordered outcome.
    async fn publish_then_reply(
        &mut self,
        event: SessionEvent,
        reply: oneshot::Sender<SessionOpResult>,
    ) {
        match self.publish(event).await {
            Ok(sequence) => {
                self.pending.insert(sequence, PendingReply { reply });
            }
            Err(e) => {
                warn!("session event publish failed: {e}");
                drop(reply.send(SessionOpResult::IncompleteOp(e.to_string())));
            }
        }
    }

    async fn publish(&mut self, event: SessionEvent) -> Result<u64, SessionLogError> {
        self.sequence += 1;
        let record = SessionStateRecord {
            server_id: self.server_id.clone(),
            sequence: self.sequence,
            event,
        };
        self.log.append(&record).await?;
        counter!("wsproxy_session_events_published_total").increment(1);
        Ok(self.sequence)
    }

    // -- consumer flow: folding the log ----------------------------------

    async fn fold(&mut self, entry: LogEntry) {
        let LogEntry {
            partition,
            offset,
            record,
        } = entry;
        let ours = record.server_id == self.server_id;
        let sequence = record.sequence;

        let result = self.apply(record).await;

        counter!("wsproxy_session_events_applied_total").increment(1);
        gauge!("wsproxy_sessions").set(self.sessions.len() as f64);

        if ours {
            if let Some(pending) = self.pending.remove(&sequence) {
                drop(pending.reply.send(result));
            }
        }

        self.positions.insert(partition, offset + 1);
        self.waiters = {
            let positions = &self.positions;
            std::mem::take(&mut self.waiters)
                .into_iter()
                .filter_map(|(targets, reply)| {
                    if caught_up(positions, &targets) {
                        let _ = reply.send(());
                        None
                    } else {
                        Some((targets, reply))
                    }
                })
                .collect()
        };
    }

    /// Apply one record to the map. Returns the [`SessionOpResult`] handed
    /// to the caller when the record was ours.
    async fn apply(&mut self, record: SessionStateRecord) -> SessionOpResult {
        match record.event {
            SessionEvent::SessionCreated {
                session_id,
                kind,
                group_id,
                max_connections,
            } => {
                if let Some(existing) = self.sessions.get(&session_id) {
                    // First creation wins; session parameters are immutable.
                    return SessionOpResult::Unchanged(existing.clone());
                }
                let session = Session::empty(kind, session_id.clone(), max_connections, group_id);
                self.sessions.insert(session_id, session.clone());
                SessionOpResult::Updated(session)
            }

            SessionEvent::InstanceAdded {
                session_id,
                instance,
            } => {
                let session = match self.sessions.get(&session_id) {
                    Some(session) => session.clone(),
                    None => {
                        // The creation event may have been compacted away;
                        // rebuild a shell around the instance until a
                        // snapshot replaces it.
                        let kind = match instance {
                            Instance::Consumer(_) => SessionKind::Consumer,
                            Instance::Producer(_) => SessionKind::Producer,
                        };
                        Session::empty(
                            kind,
                            session_id.clone(),
                            crate::session::DEFAULT_MAX_CONNECTIONS,
                            None,
                        )
                    }
                };

                let hosted_here = instance.server_id() == &self.server_id;
                let instance_id = instance.full_id();
                let (folded, over_quota) = session.apply_instance_added(instance);

                if over_quota {
                    counter!("wsproxy_session_quota_conflicts_total").increment(1);
                    warn!(
                        session = %session_id,
                        instance = %instance_id,
                        "instance admitted over quota by a concurrent add"
                    );
                }
                self.sessions.insert(session_id.clone(), folded.clone());
                self.note_mutation(&session_id).await;

                if over_quota && hosted_here {
                    // We lost the race: compensate on the log and refuse the
                    // caller, the socket is never opened.
                    if let Err(e) = self
                        .publish(SessionEvent::InstanceRemoved {
                            session_id: session_id.clone(),
                            instance_id: instance_id.clone(),
                        })
                        .await
                    {
                        warn!(
                            instance = %instance_id,
                            "failed to publish compensating removal: {e}"
                        );
                    }
                    return SessionOpResult::InstanceLimitReached(
                        folded.apply_instance_removed(&instance_id),
                    );
                }
                SessionOpResult::Updated(folded)
            }

            SessionEvent::InstanceRemoved {
                session_id,
                instance_id,
            } => {
                let Some(session) = self.sessions.get(&session_id) else {
                    return SessionOpResult::SessionNotFound(session_id);
                };
                let removed = session.instance_for(&instance_id);
                let folded = session.apply_instance_removed(&instance_id);
                self.sessions.insert(session_id.clone(), folded.clone());
                self.note_mutation(&session_id).await;

                if let Some(removed) = removed {
                    // A removal we did not initiate for a socket we host is
                    // an eviction order (e.g. a compensating removal).
                    if removed.server_id() == &self.server_id
                        && record.server_id != self.server_id
                    {
                        self.evict(session_id, instance_id);
                    }
                    SessionOpResult::Updated(folded)
                } else {
                    SessionOpResult::Unchanged(folded)
                }
            }

            SessionEvent::SessionRemoved { session_id } => {
                if let Some(session) = self.sessions.remove(&session_id) {
                    self.mutations_since_snapshot.remove(&session_id);
                    for instance in session.instances() {
                        if instance.server_id() == &self.server_id {
                            self.evict(session_id.clone(), instance.full_id());
                        }
                    }
                    SessionOpResult::Updated(session)
                } else {
                    SessionOpResult::SessionNotFound(session_id)
                }
            }

            SessionEvent::SessionSnapshot { session } => {
                self.sessions
                    .insert(session.session_id().clone(), session.clone());
                SessionOpResult::Updated(session)
            }
        }
    }

    fn evict(&self, session_id: SessionId, instance_id: FullClientId) {
        counter!("wsproxy_session_evictions_total").increment(1);
        info!(session = %session_id, instance = %instance_id, "evicting local socket");
        drop(self.evictions.send(Eviction {
            session_id,
            instance_id,
        }));
    }

    /// Periodic snapshots keep a compacted log reconstructible: compaction
    /// retains only the latest record per session key.
    async fn note_mutation(&mut self, session_id: &SessionId) {
        let count = self
            .mutations_since_snapshot
            .entry(session_id.clone())
            .or_insert(0);
        *count += 1;
        if *count < self.snapshot_interval {
            return;
        }
        *count = 0;
        let Some(session) = self.sessions.get(session_id).cloned() else {
            return;
        };
        if let Err(e) = self.publish(SessionEvent::SessionSnapshot { session }).await {
            warn!(session = %session_id, "failed to publish session snapshot: {e}");
        }
    }

    fn caught_up_to(&self, targets: &[PartitionEnd]) -> bool {
        caught_up(&self.positions, targets)
    }
}

/// Sequences restart above any value a previous incarnation of this node
/// can have published, so a replayed record never matches a live pending
/// reply.
fn initial_sequence() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn caught_up(positions: &HashMap<i32, i64>, targets: &[PartitionEnd]) -> bool {
    targets.iter().all(|target| {
        positions.get(&target.partition).copied().unwrap_or(0) >= target.end_offset
    })
}

/// Sessions are keyed by the consumer group id or the producer id.
pub fn session_id_of(id: &FullClientId) -> SessionId {
    match id {
        FullClientId::Consumer(id) => SessionId::new(id.group_id.as_str().to_string()),
        FullClientId::Producer(id) => SessionId::new(id.producer_id.as_str().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::log::MemorySessionLog;
    use async_trait::async_trait;

    const WAIT: Duration = Duration::from_secs(5);

    fn handler_over(log: Arc<dyn SessionLog>, node: &str) -> SessionHandler {
        SessionHandler::spawn(
            ServerId::from(node),
            log,
            SessionHandlerOptions::default(),
        )
    }

    async fn init_consumer(handler: &SessionHandler, group: &str, cap: u32) -> SessionOpResult {
        handler
            .init_session(
                SessionId::from(group),
                SessionKind::Consumer,
                cap,
                Some(GroupId::from(group)),
            )
            .await
    }

    #[tokio::test]
    async fn init_add_get_remove_round_trip() {
        let log = Arc::new(MemorySessionLog::new());
        let handler = handler_over(log, "n1");

        match init_consumer(&handler, "g1", 2).await {
            SessionOpResult::Updated(session) => assert_eq!(session.instance_count(), 0),
            other => panic!("init: expected Updated, got {other:?}"),
        }

        let id = FullConsumerId::from(("g1", "c1"));
        match handler.add_consumer(id.clone(), ServerId::from("n1")).await {
            SessionOpResult::Updated(session) => assert_eq!(session.instance_count(), 1),
            other => panic!("add: expected Updated, got {other:?}"),
        }

        // Read-your-writes: the map reflects the add before the reply.
        match handler.session_for(SessionId::from("g1")).await {
            SessionOpResult::Unchanged(session) => {
                assert!(session.contains(&FullClientId::Consumer(id.clone())));
            }
            other => panic!("get: expected Unchanged, got {other:?}"),
        }

        match handler
            .remove_consumer(id.clone(), ServerId::from("n1"))
            .await
        {
            SessionOpResult::Updated(session) => assert_eq!(session.instance_count(), 0),
            other => panic!("remove: expected Updated, got {other:?}"),
        }

        // Cleanup is idempotent: the second removal is a plain no-op.
        match handler.remove_consumer(id, ServerId::from("n1")).await {
            SessionOpResult::Unchanged(session) => assert_eq!(session.instance_count(), 0),
            other => panic!("re-remove: expected Unchanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_without_init_is_not_found() {
        let log = Arc::new(MemorySessionLog::new());
        let handler = handler_over(log, "n1");

        let result = handler
            .add_consumer(FullConsumerId::from(("ghost", "c1")), ServerId::from("n1"))
            .await;
        assert_eq!(result, SessionOpResult::SessionNotFound(SessionId::from("ghost")));
    }

    #[tokio::test]
    async fn quota_rejection_emits_nothing() {
        let log = Arc::new(MemorySessionLog::new());
        let handler = handler_over(log.clone(), "n1");

        assert!(init_consumer(&handler, "g1", 1).await.is_success());
        assert!(handler
            .add_consumer(FullConsumerId::from(("g1", "c1")), ServerId::from("n1"))
            .await
            .is_success());

        let before = log.end_offsets().await.expect("end offsets")[0].end_offset;
        match handler
            .add_consumer(FullConsumerId::from(("g1", "c2")), ServerId::from("n1"))
            .await
        {
            SessionOpResult::InstanceLimitReached(session) => {
                assert_eq!(session.instance_count(), 1)
            }
            other => panic!("expected InstanceLimitReached, got {other:?}"),
        }
        let after = log.end_offsets().await.expect("end offsets")[0].end_offset;
        assert_eq!(before, after, "a refused add must not reach the log");
    }

    #[tokio::test]
    async fn reinit_is_unchanged_and_kind_mismatch_rejected() {
        let log = Arc::new(MemorySessionLog::new());
        let handler = handler_over(log, "n1");

        assert!(init_consumer(&handler, "g1", 2).await.is_success());
        match init_consumer(&handler, "g1", 5).await {
            // max_connections is immutable after creation
            SessionOpResult::Unchanged(session) => assert_eq!(session.max_connections(), 2),
            other => panic!("expected Unchanged, got {other:?}"),
        }

        match handler
            .init_session(SessionId::from("g1"), SessionKind::Producer, 1, None)
            .await
        {
            SessionOpResult::InstanceTypeForSessionIncorrect(session) => {
                assert_eq!(session.kind(), SessionKind::Consumer)
            }
            other => panic!("expected InstanceTypeForSessionIncorrect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_events_converge_the_local_view() {
        let log = Arc::new(MemorySessionLog::new());
        let local = handler_over(log.clone(), "n1");
        let remote = handler_over(log.clone(), "n2");

        assert!(init_consumer(&remote, "g1", 2).await.is_success());
        assert!(remote
            .add_consumer(FullConsumerId::from(("g1", "c9")), ServerId::from("n2"))
            .await
            .is_success());

        local.await_up_to(WAIT).await.expect("catch up");
        match local.session_for(SessionId::from("g1")).await {
            SessionOpResult::Unchanged(session) => {
                assert!(session
                    .contains(&FullClientId::Consumer(FullConsumerId::from(("g1", "c9")))));
            }
            other => panic!("expected Unchanged, got {other:?}"),
        }
    }

    struct FailingLog {
        inner: MemorySessionLog,
    }

    #[async_trait]
    impl SessionLog for FailingLog {
        async fn append(&self, _record: &SessionStateRecord) -> Result<(), SessionLogError> {
            Err(SessionLogError::Publish("broker down".to_string()))
        }

        async fn end_offsets(&self) -> Result<Vec<PartitionEnd>, SessionLogError> {
            self.inner.end_offsets().await
        }

        fn subscribe(&self) -> mpsc::Receiver<LogEntry> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn publish_failure_is_incomplete_and_leaves_no_state() {
        let log = Arc::new(FailingLog {
            inner: MemorySessionLog::new(),
        });
        let handler = handler_over(log, "n1");

        match init_consumer(&handler, "g1", 1).await {
            SessionOpResult::IncompleteOp(message) => {
                assert!(message.contains("broker down"), "got: {message}")
            }
            other => panic!("expected IncompleteOp, got {other:?}"),
        }

        assert_eq!(
            handler.session_for(SessionId::from("g1")).await,
            SessionOpResult::SessionNotFound(SessionId::from("g1"))
        );
    }

    struct StalledLog;

    #[async_trait]
    impl SessionLog for StalledLog {
        async fn append(&self, _record: &SessionStateRecord) -> Result<(), SessionLogError> {
            // Broker ack never arrives.
            std::future::pending().await
        }

        async fn end_offsets(&self) -> Result<Vec<PartitionEnd>, SessionLogError> {
            Ok(vec![])
        }

        fn subscribe(&self) -> mpsc::Receiver<LogEntry> {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move { tx.closed().await });
            rx
        }
    }

    #[tokio::test]
    async fn rpc_deadline_yields_incomplete_op() {
        let handler = SessionHandler::spawn(
            ServerId::from("n1"),
            Arc::new(StalledLog),
            SessionHandlerOptions {
                rpc_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );

        match init_consumer(&handler, "g1", 1).await {
            SessionOpResult::IncompleteOp(message) => {
                assert!(message.contains("timed out"), "got: {message}")
            }
            other => panic!("expected IncompleteOp, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_up_to_resolves_once_caught_up() {
        let log = Arc::new(MemorySessionLog::new());
        let writer = handler_over(log.clone(), "n1");
        assert!(init_consumer(&writer, "g1", 1).await.is_success());
        assert!(init_consumer(&writer, "g2", 1).await.is_success());

        let reader = handler_over(log.clone(), "n2");
        reader.await_up_to(WAIT).await.expect("catch up");
        assert!(matches!(
            reader.session_for(SessionId::from("g2")).await,
            SessionOpResult::Unchanged(_)
        ));
    }

    #[tokio::test]
    async fn compacted_add_rebuilds_a_session_shell() {
        // An InstanceAdded whose SessionCreated was compacted away still
        // folds into a usable session.
        let log = Arc::new(MemorySessionLog::new());
        log.append(&SessionStateRecord {
            server_id: ServerId::from("n9"),
            sequence: 1,
            event: SessionEvent::InstanceAdded {
                session_id: SessionId::from("g1"),
                instance: Instance::consumer(
                    FullConsumerId::from(("g1", "c1")),
                    ServerId::from("n9"),
                ),
            },
        })
        .await
        .expect("append");

        let handler = handler_over(log, "n1");
        handler.await_up_to(WAIT).await.expect("catch up");

        match handler.session_for(SessionId::from("g1")).await {
            SessionOpResult::Unchanged(session) => {
                assert_eq!(session.kind(), SessionKind::Consumer);
                assert_eq!(session.instance_count(), 1);
            }
            other => panic!("expected Unchanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_replaces_the_entry_wholesale() {
        let log = Arc::new(MemorySessionLog::new());
        let handler = handler_over(log.clone(), "n1");
        assert!(init_consumer(&handler, "g1", 1).await.is_success());

        let mut replacement = Session::empty(
            SessionKind::Consumer,
            SessionId::from("g1"),
            3,
            Some(GroupId::from("g1")),
        );
        replacement = match replacement.add_instance(Instance::consumer(
            FullConsumerId::from(("g1", "cX")),
            ServerId::from("n7"),
        )) {
            SessionOpResult::Updated(s) => s,
            other => panic!("expected Updated, got {other:?}"),
        };
        log.append(&SessionStateRecord {
            server_id: ServerId::from("n7"),
            sequence: 1,
            event: SessionEvent::SessionSnapshot {
                session: replacement.clone(),
            },
        })
        .await
        .expect("append");

        handler.await_up_to(WAIT).await.expect("catch up");
        assert_eq!(
            handler.session_for(SessionId::from("g1")).await,
            SessionOpResult::Unchanged(replacement)
        );
    }
}
