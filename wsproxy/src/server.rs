use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use rdkafka::producer::Producer;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::health::HealthRegistry;
use crate::kafka;
use crate::router;
use crate::session::handler::{SessionHandler, SessionHandlerOptions};
use crate::session::log::KafkaSessionLog;
use crate::session::TopicName;

const CATCH_UP_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");
    let server_id = config.resolved_server_id();
    info!(server_id = %server_id, "starting wsproxy");

    kafka::ensure_session_topic(&config.kafka, &config.session)
        .await
        .expect("failed to prepare the session-state topic");

    let producer_liveness = liveness.register("rdkafka", Duration::from_secs(30));
    let producer = kafka::create_producer(&config.kafka, producer_liveness)
        .expect("failed to create Kafka producer");

    let log = KafkaSessionLog::new(
        producer.clone(),
        kafka::session_log_reader_config(&config.kafka, server_id.as_str()),
        TopicName::new(config.session.session_state_topic_name.clone()),
        Duration::from_millis(config.kafka.kafka_message_timeout_ms as u64),
    )
    .expect("failed to create the session log");

    let handler_liveness = liveness.register("session_handler", Duration::from_secs(30));
    let handler = SessionHandler::spawn(
        server_id,
        Arc::new(log),
        SessionHandlerOptions {
            rpc_timeout: config.session.rpc_timeout(),
            snapshot_interval: config.session.session_snapshot_interval,
            liveness: Some(handler_liveness),
        },
    );

    // One-time barrier: sockets are only served once the local registry
    // view has caught up with the log tail.
    handler
        .await_up_to(CATCH_UP_TIMEOUT)
        .await
        .expect("session registry failed to catch up with the log");
    info!("session registry caught up");

    let auth = Authenticator::from_config(&config.basic_auth, &config.openid)
        .expect("invalid auth configuration");

    let app = router::router(
        liveness,
        handler,
        producer.clone(),
        auth,
        &config,
        config.export_prometheus,
    );

    info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();

    // Socket tasks have flushed their commit stacks by now; drain whatever
    // the shared producer still holds in its queue.
    if let Err(e) = producer.flush(Duration::from_secs(30)) {
        warn!("failed to flush Kafka producer on shutdown: {e}");
    }
}
