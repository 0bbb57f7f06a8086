//! rdkafka client construction and the thin wrappers the rest of the
//! proxy works against.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, error, info};

use crate::api::ProxyError;
use crate::commit::{CommitError, CommitOffsets};
use crate::config::{KafkaConfig, SessionStateConfig};
use crate::health::HealthHandle;
use crate::session::{GroupId, TopicName};

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("wsproxy_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("wsproxy_kafka_callback_queue_depth").set(stats.replyq as f64);
        for (_, broker) in stats.brokers {
            let id = broker.nodeid.to_string();
            counter!("wsproxy_kafka_broker_tx_errors_total", "broker" => id.clone())
                .absolute(broker.txerrs);
            counter!("wsproxy_kafka_broker_rx_errors_total", "broker" => id)
                .absolute(broker.rxerrs);
        }
    }
}

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.kafka_bootstrap_urls);
    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
    client_config
}

/// The process-wide producer: producer sockets and the session log share it.
pub fn create_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    info!(
        "connecting to Kafka brokers at {}...",
        config.kafka_bootstrap_urls
    );

    let mut client_config = base_client_config(config);
    client_config
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext { liveness })?;

    // "Ping" the brokers by requesting metadata, fail fast when unreachable
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(10))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, {} topics visible",
                metadata.topics().len()
            );
            Ok(producer)
        }
        Err(e) => {
            error!("failed to fetch metadata from Kafka brokers: {e}");
            Err(e)
        }
    }
}

/// Client config for session log readers. Every node must see the whole
/// log, so the group id is unique per process and never commits.
pub fn session_log_reader_config(config: &KafkaConfig, server_id: &str) -> ClientConfig {
    let mut client_config = base_client_config(config);
    client_config
        .set("group.id", format!("wsproxy.session.{server_id}"))
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "earliest");
    client_config
}

/// Consumer for one `/socket/out` connection, joining the client's own
/// consumer group. Offsets are committed only through the commit stack.
pub fn create_socket_consumer(
    config: &KafkaConfig,
    group_id: &GroupId,
    client_id: &str,
) -> Result<StreamConsumer, ProxyError> {
    let mut client_config = base_client_config(config);
    client_config
        .set("group.id", group_id.as_str())
        .set("client.id", client_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "earliest");

    client_config
        .create()
        .map_err(|e| ProxyError::Kafka(e.to_string()))
}

/// Verify a topic exists before opening a socket against it.
pub async fn topic_exists(
    producer: &FutureProducer<KafkaContext>,
    topic: &TopicName,
) -> Result<bool, ProxyError> {
    let producer = producer.clone();
    let topic = topic.clone();
    tokio::task::spawn_blocking(move || {
        let metadata = producer
            .client()
            .fetch_metadata(Some(topic.as_str()), Duration::from_secs(5))
            .map_err(|e| ProxyError::Kafka(e.to_string()))?;
        Ok(metadata
            .topics()
            .iter()
            .any(|t| t.name() == topic.as_str() && t.error().is_none() && !t.partitions().is_empty()))
    })
    .await
    .map_err(|e| ProxyError::Kafka(e.to_string()))?
}

/// Create the compacted session-state topic when missing. Retries a few
/// times so a node racing its broker at boot does not immediately die;
/// running out of retries is a startup failure.
pub async fn ensure_session_topic(
    kafka: &KafkaConfig,
    session: &SessionStateConfig,
) -> anyhow::Result<()> {
    const ATTEMPTS: u32 = 5;

    let admin: AdminClient<DefaultClientContext> = base_client_config(kafka).create()?;
    let retention = session.session_state_retention_ms.to_string();
    // A single partition keeps the session log totally ordered.
    let topic = NewTopic::new(
        &session.session_state_topic_name,
        1,
        TopicReplication::Fixed(session.session_state_replication_factor),
    )
    .set("cleanup.policy", "compact")
    .set("retention.ms", &retention);

    let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));

    let mut last_error = None;
    for attempt in 1..=ATTEMPTS {
        match admin.create_topics([&topic], &options).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(name) => info!("created session-state topic {name}"),
                        Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                            debug!("session-state topic {name} already exists")
                        }
                        Err((name, code)) => {
                            anyhow::bail!("failed to create session-state topic {name}: {code}")
                        }
                    }
                }
                return Ok(());
            }
            Err(e) => {
                error!("session-state topic setup attempt {attempt}/{ATTEMPTS} failed: {e}");
                last_error = Some(e);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    Err(anyhow::anyhow!(
        "session-state topic unreachable: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Commits through the socket's consumer group, waiting for the broker ack.
pub struct KafkaOffsetCommitter {
    consumer: Arc<StreamConsumer>,
    topic: TopicName,
}

impl KafkaOffsetCommitter {
    pub fn new(consumer: Arc<StreamConsumer>, topic: TopicName) -> Self {
        Self { consumer, topic }
    }
}

#[async_trait]
impl CommitOffsets for KafkaOffsetCommitter {
    async fn commit(&self, partition: i32, next_offset: i64) -> Result<(), CommitError> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        // The synchronous commit blocks on the broker round-trip.
        tokio::task::spawn_blocking(move || {
            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(topic.as_str(), partition, Offset::Offset(next_offset))
                .map_err(|e| CommitError::Commit(e.to_string()))?;
            consumer
                .commit(&offsets, rdkafka::consumer::CommitMode::Sync)
                .map_err(|e| CommitError::Commit(e.to_string()))
        })
        .await
        .map_err(|e| CommitError::Commit(e.to_string()))?
    }
}
