//! The register/reject/remove flow around each WebSocket:
//! auth -> params -> session registry -> Kafka stream -> cleanup.

use tracing::{info, warn};

use crate::session::handler::SessionHandler;
use crate::session::state::SessionOpResult;
use crate::session::FullClientId;

pub mod consumer;
pub mod params;
pub mod producer;

/// Holds one socket's registration in the session registry and guarantees
/// deregistration runs exactly once, whichever way the socket ends.
///
/// The normal path calls [`deregister`](Self::deregister) after the stream
/// finishes; the `Drop` impl covers panics and task cancellation with a
/// fire-and-forget removal. Removal itself is idempotent at the registry,
/// so even a double call converges.
pub(crate) struct Registration {
    handler: SessionHandler,
    id: FullClientId,
    done: bool,
}

impl Registration {
    pub(crate) fn new(handler: SessionHandler, id: FullClientId) -> Self {
        Self {
            handler,
            id,
            done: false,
        }
    }

    pub(crate) async fn deregister(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let result = remove(&self.handler, &self.id).await;
        log_removal(&self.id, &result);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let handler = self.handler.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let result = remove(&handler, &id).await;
            log_removal(&id, &result);
        });
    }
}

async fn remove(handler: &SessionHandler, id: &FullClientId) -> SessionOpResult {
    match id {
        FullClientId::Consumer(id) => {
            handler
                .remove_consumer(id.clone(), handler.server_id().clone())
                .await
        }
        FullClientId::Producer(id) => {
            handler
                .remove_producer(id.clone(), handler.server_id().clone())
                .await
        }
    }
}

fn log_removal(id: &FullClientId, result: &SessionOpResult) {
    match result {
        SessionOpResult::Updated(_) => info!(instance = %id, "socket deregistered"),
        SessionOpResult::Unchanged(_) | SessionOpResult::SessionNotFound(_) => {
            // Already gone: an eviction or an earlier cleanup beat us to it.
        }
        other => warn!(instance = %id, "socket deregistration did not complete: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::handler::SessionHandlerOptions;
    use crate::session::log::MemorySessionLog;
    use crate::session::{FullConsumerId, GroupId, ServerId, SessionId, SessionKind};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn deregister_runs_once_and_drop_is_quiet_after() {
        let log = Arc::new(MemorySessionLog::new());
        let handler = SessionHandler::spawn(
            ServerId::from("n1"),
            log,
            SessionHandlerOptions::default(),
        );

        assert!(handler
            .init_session(
                SessionId::from("g1"),
                SessionKind::Consumer,
                1,
                Some(GroupId::from("g1")),
            )
            .await
            .is_success());
        let id = FullConsumerId::from(("g1", "c1"));
        assert!(handler
            .add_consumer(id.clone(), ServerId::from("n1"))
            .await
            .is_success());

        let mut registration =
            Registration::new(handler.clone(), FullClientId::Consumer(id.clone()));
        registration.deregister().await;
        drop(registration);

        match handler.session_for(SessionId::from("g1")).await {
            SessionOpResult::Unchanged(session) => assert_eq!(session.instance_count(), 0),
            other => panic!("expected Unchanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_without_deregister_still_removes() {
        let log = Arc::new(MemorySessionLog::new());
        let handler = SessionHandler::spawn(
            ServerId::from("n1"),
            log,
            SessionHandlerOptions::default(),
        );

        assert!(handler
            .init_session(
                SessionId::from("g1"),
                SessionKind::Consumer,
                1,
                Some(GroupId::from("g1")),
            )
            .await
            .is_success());
        let id = FullConsumerId::from(("g1", "c1"));
        assert!(handler
            .add_consumer(id.clone(), ServerId::from("n1"))
            .await
            .is_success());

        drop(Registration::new(
            handler.clone(),
            FullClientId::Consumer(id),
        ));

        // The drop path removes asynchronously.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let SessionOpResult::Unchanged(session) =
                handler.session_for(SessionId::from("g1")).await
            {
                if session.instance_count() == 0 {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "drop cleanup never removed the instance"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
