//! The replicated log seam: where session events meet Kafka.
//!
//! The handler only sees the [`SessionLog`] trait, so tests (and the
//! single-node dev mode) run against [`MemorySessionLog`] while production
//! uses [`KafkaSessionLog`] over the compacted session-state topic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::kafka::KafkaContext;
use crate::session::codec::{self, SessionStateRecord};
use crate::session::TopicName;

#[derive(Debug, Error)]
pub enum SessionLogError {
    #[error("failed to publish session event: {0}")]
    Publish(String),
    #[error("session log unreachable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
}

/// One consumed record together with its position in the log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub partition: i32,
    pub offset: i64,
    pub record: SessionStateRecord,
}

/// The next offset to be written per partition, as observed at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEnd {
    pub partition: i32,
    pub end_offset: i64,
}

#[async_trait]
pub trait SessionLog: Send + Sync + 'static {
    /// Append a record and wait for the broker ack.
    async fn append(&self, record: &SessionStateRecord) -> Result<(), SessionLogError>;

    /// The current end of the log, for catch-up barriers.
    async fn end_offsets(&self) -> Result<Vec<PartitionEnd>, SessionLogError>;

    /// Start a reader at the earliest offset, feeding decoded records into
    /// the returned channel for as long as the receiver is held.
    fn subscribe(&self) -> mpsc::Receiver<LogEntry>;
}

const READER_CHANNEL_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Kafka-backed log
// ---------------------------------------------------------------------------

pub struct KafkaSessionLog {
    producer: FutureProducer<KafkaContext>,
    reader_config: ClientConfig,
    metadata: Arc<BaseConsumer>,
    topic: TopicName,
    publish_timeout: Duration,
}

impl KafkaSessionLog {
    /// `reader_config` must carry a process-unique `group.id`: every node
    /// reads the whole log, so readers never share a consumer group.
    pub fn new(
        producer: FutureProducer<KafkaContext>,
        reader_config: ClientConfig,
        topic: TopicName,
        publish_timeout: Duration,
    ) -> Result<Self, SessionLogError> {
        let metadata: BaseConsumer = reader_config
            .create()
            .map_err(|e| SessionLogError::Unavailable(e.to_string()))?;
        Ok(Self {
            producer,
            reader_config,
            metadata: Arc::new(metadata),
            topic,
            publish_timeout,
        })
    }
}

#[async_trait]
impl SessionLog for KafkaSessionLog {
    async fn append(&self, record: &SessionStateRecord) -> Result<(), SessionLogError> {
        let payload = codec::encode(record)?;
        let delivery = self
            .producer
            .send_result(FutureRecord {
                topic: self.topic.as_str(),
                payload: Some(&payload),
                partition: None,
                key: Some(record.key()),
                timestamp: None,
                headers: None,
            })
            .map_err(|(e, _)| SessionLogError::Publish(e.to_string()))?;

        match tokio::time::timeout(self.publish_timeout, delivery).await {
            Ok(Ok(Ok(_))) => Ok(()),
            Ok(Ok(Err((e, _)))) => Err(SessionLogError::Publish(e.to_string())),
            Ok(Err(canceled)) => Err(SessionLogError::Publish(canceled.to_string())),
            Err(_) => Err(SessionLogError::Publish("publish timed out".to_string())),
        }
    }

    async fn end_offsets(&self) -> Result<Vec<PartitionEnd>, SessionLogError> {
        let metadata = self.metadata.clone();
        let topic = self.topic.clone();
        // librdkafka's watermark fetch is blocking
        tokio::task::spawn_blocking(move || {
            let cluster = metadata
                .fetch_metadata(Some(topic.as_str()), Duration::from_secs(5))
                .map_err(|e| SessionLogError::Unavailable(e.to_string()))?;
            let partitions = cluster
                .topics()
                .iter()
                .find(|t| t.name() == topic.as_str())
                .map(|t| t.partitions().len() as i32)
                .unwrap_or(0);

            let mut ends = Vec::with_capacity(partitions as usize);
            for partition in 0..partitions {
                let (_, high) = metadata
                    .fetch_watermarks(topic.as_str(), partition, Duration::from_secs(5))
                    .map_err(|e| SessionLogError::Unavailable(e.to_string()))?;
                ends.push(PartitionEnd {
                    partition,
                    end_offset: high,
                });
            }
            Ok(ends)
        })
        .await
        .map_err(|e| SessionLogError::Unavailable(e.to_string()))?
    }

    fn subscribe(&self) -> mpsc::Receiver<LogEntry> {
        let (tx, rx) = mpsc::channel(READER_CHANNEL_DEPTH);
        let config = self.reader_config.clone();
        let topic = self.topic.clone();

        tokio::spawn(async move {
            let consumer: StreamConsumer = match config.create() {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!("failed to create session log reader: {e}");
                    return;
                }
            };
            if let Err(e) = consumer.subscribe(&[topic.as_str()]) {
                warn!("failed to subscribe to {}: {e}", topic);
                return;
            }
            info!("session log reader subscribed to {}", topic);

            loop {
                let message = match consumer.recv().await {
                    Ok(message) => message,
                    Err(e) => {
                        // librdkafka keeps retrying underneath; we only log
                        // and poll again, the handler serves from its
                        // last-known map in the meantime.
                        warn!("session log reader error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let Some(payload) = message.payload() else {
                    // Compaction tombstone, nothing to fold.
                    continue;
                };
                let record = match codec::decode(payload) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(
                            "skipping undecodable session record at {}/{}: {e}",
                            message.partition(),
                            message.offset()
                        );
                        continue;
                    }
                };
                let entry = LogEntry {
                    partition: message.partition(),
                    offset: message.offset(),
                    record,
                };
                if tx.send(entry).await.is_err() {
                    // Handler dropped the receiver, we are shutting down.
                    return;
                }
            }
        });

        rx
    }
}

// ---------------------------------------------------------------------------
// In-memory log
// ---------------------------------------------------------------------------

/// Single-partition, in-process log. Appends are totally ordered; every
/// subscriber replays from the start and then follows the tail, exactly the
/// contract the Kafka log provides.
pub struct MemorySessionLog {
    entries: Mutex<Vec<SessionStateRecord>>,
    tail: broadcast::Sender<LogEntry>,
}

impl MemorySessionLog {
    pub fn new() -> Self {
        let (tail, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(Vec::new()),
            tail,
        }
    }
}

impl Default for MemorySessionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionLog for MemorySessionLog {
    async fn append(&self, record: &SessionStateRecord) -> Result<(), SessionLogError> {
        let mut entries = self.entries.lock().expect("poisoned session log mutex");
        let offset = entries.len() as i64;
        entries.push(record.clone());
        // Holding the lock across the send keeps broadcast order identical
        // to append order.
        drop(self.tail.send(LogEntry {
            partition: 0,
            offset,
            record: record.clone(),
        }));
        Ok(())
    }

    async fn end_offsets(&self) -> Result<Vec<PartitionEnd>, SessionLogError> {
        let entries = self.entries.lock().expect("poisoned session log mutex");
        Ok(vec![PartitionEnd {
            partition: 0,
            end_offset: entries.len() as i64,
        }])
    }

    fn subscribe(&self) -> mpsc::Receiver<LogEntry> {
        let (tx, rx) = mpsc::channel(READER_CHANNEL_DEPTH);

        // Snapshot and subscribe under one lock so replay + tail covers
        // every append exactly once.
        let (snapshot, mut tail) = {
            let entries = self.entries.lock().expect("poisoned session log mutex");
            (entries.clone(), self.tail.subscribe())
        };

        tokio::spawn(async move {
            let replayed = snapshot.len() as i64;
            for (offset, record) in snapshot.into_iter().enumerate() {
                let entry = LogEntry {
                    partition: 0,
                    offset: offset as i64,
                    record,
                };
                if tx.send(entry).await.is_err() {
                    return;
                }
            }
            loop {
                match tail.recv().await {
                    Ok(entry) => {
                        if entry.offset < replayed {
                            continue;
                        }
                        if tx.send(entry).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("in-memory session log reader lagged by {missed} records");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::codec::SessionEvent;
    use crate::session::{ServerId, SessionId};

    fn record(sequence: u64) -> SessionStateRecord {
        SessionStateRecord {
            server_id: ServerId::from("n1"),
            sequence,
            event: SessionEvent::SessionRemoved {
                session_id: SessionId::from("g1"),
            },
        }
    }

    #[tokio::test]
    async fn replays_then_follows() {
        let log = MemorySessionLog::new();
        log.append(&record(1)).await.expect("append");
        log.append(&record(2)).await.expect("append");

        let mut rx = log.subscribe();
        assert_eq!(rx.recv().await.expect("replayed").record.sequence, 1);
        assert_eq!(rx.recv().await.expect("replayed").record.sequence, 2);

        log.append(&record(3)).await.expect("append");
        let tail = rx.recv().await.expect("tailed");
        assert_eq!(tail.record.sequence, 3);
        assert_eq!(tail.offset, 2);
    }

    #[tokio::test]
    async fn end_offsets_track_appends() {
        let log = MemorySessionLog::new();
        assert_eq!(
            log.end_offsets().await.expect("end offsets"),
            vec![PartitionEnd {
                partition: 0,
                end_offset: 0
            }]
        );
        log.append(&record(1)).await.expect("append");
        assert_eq!(
            log.end_offsets().await.expect("end offsets")[0].end_offset,
            1
        );
    }
}
