//! `/socket/out`: a long-lived WebSocket streaming one topic to a client,
//! with client-acknowledged offsets reconciled through the commit stack.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use base64::prelude::*;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use governor::{Quota, RateLimiter};
use metrics::counter;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::Message as _;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::api::{rejection_for, ErrorMessage, ProxyError};
use crate::commit::{CommitStack, CommitStackOptions};
use crate::frames::{AckFrame, DeliveryFrame, FormatType, RecordHeader, WsMessageId};
use crate::kafka::{self, KafkaOffsetCommitter};
use crate::router;
use crate::session::handler::{session_id_of, Eviction};
use crate::session::{FullClientId, FullConsumerId, SessionKind};
use crate::socket::params::ConsumerParams;
use crate::socket::Registration;

type DeliveryLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[instrument(skip_all)]
pub async fn socket_out(
    state: State<router::State>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ProxyError> {
    state.auth.authenticate(&headers).await?;
    let params = ConsumerParams::parse(query.as_deref().unwrap_or(""))?;
    if !kafka::topic_exists(&state.producer, &params.topic).await? {
        return Err(ProxyError::TopicNotFound(params.topic));
    }

    let full_id = FullConsumerId {
        group_id: params.group_id.clone(),
        client_id: params.client_id.clone(),
    };
    let client_id = FullClientId::Consumer(full_id.clone());
    let session_id = session_id_of(&client_id);

    let init = state
        .handler
        .init_session(
            session_id.clone(),
            SessionKind::Consumer,
            state.session.session_consumer_max_connections,
            Some(params.group_id.clone()),
        )
        .await;
    if !init.is_success() {
        return Err(rejection_for(&session_id, &init));
    }

    let added = state
        .handler
        .add_consumer(full_id, state.handler.server_id().clone())
        .await;
    if !added.is_success() {
        counter!("wsproxy_sockets_rejected_total", "kind" => "consumer").increment(1);
        return Err(rejection_for(&session_id, &added));
    }

    // The registration must not outlive a consumer we failed to build.
    let consumer = match kafka::create_socket_consumer(
        &state.kafka,
        &params.group_id,
        params.client_id.as_str(),
    ) {
        Ok(consumer) => Arc::new(consumer),
        Err(e) => {
            Registration::new(state.handler.clone(), client_id)
                .deregister()
                .await;
            return Err(e);
        }
    };

    info!(instance = %client_id, topic = %params.topic, "consumer socket opened");
    counter!("wsproxy_sockets_opened_total", "kind" => "consumer").increment(1);

    let state = state.0.clone();
    let evictions = state.handler.subscribe_evictions();
    Ok(ws.on_upgrade(move |socket| run(socket, state, params, client_id, consumer, evictions)))
}

async fn run(
    socket: WebSocket,
    state: router::State,
    params: ConsumerParams,
    client_id: FullClientId,
    consumer: Arc<StreamConsumer>,
    evictions: broadcast::Receiver<Eviction>,
) {
    let mut registration = Registration::new(state.handler.clone(), client_id.clone());

    let mut stack = CommitStack::new(
        KafkaOffsetCommitter::new(consumer.clone(), params.topic.clone()),
        CommitStackOptions {
            max_stack_size: state.commit.commit_max_stack_size,
            auto_commit_max_age: state.commit.auto_commit_max_age(),
        },
    );

    let result = stream_records(
        socket,
        &state,
        &params,
        &client_id,
        &consumer,
        &mut stack,
        evictions,
    )
    .await;
    if let Err(e) = &result {
        warn!(instance = %client_id, "consumer socket failed: {e}");
    }

    // Flush whatever is still committable, then deregister; both run on
    // every exit path.
    if let Err(e) = stack.close().await {
        warn!(instance = %client_id, "commit stack flush failed: {e}");
    }
    registration.deregister().await;
    counter!("wsproxy_sockets_closed_total", "kind" => "consumer").increment(1);
}

async fn stream_records(
    socket: WebSocket,
    state: &router::State,
    params: &ConsumerParams,
    client_id: &FullClientId,
    consumer: &StreamConsumer,
    stack: &mut CommitStack<KafkaOffsetCommitter>,
    mut evictions: broadcast::Receiver<Eviction>,
) -> Result<(), ProxyError> {
    consumer
        .subscribe(&[params.topic.as_str()])
        .map_err(|e| ProxyError::Kafka(e.to_string()))?;

    let (mut ws_tx, mut ws_rx) = socket.split();

    let rate = params
        .rate
        .unwrap_or(state.consumer_defaults.consumer_default_rate_limit);
    let limiter = NonZeroU32::new(rate).map(|rate| RateLimiter::direct(Quota::per_second(rate)));
    let batch_size = params
        .batch_size
        .unwrap_or(state.consumer_defaults.consumer_default_batch_size)
        .max(1);
    let auto_commit = params
        .auto_commit
        .unwrap_or(state.commit.commit_auto_commit_enabled);

    let mut flush = tokio::time::interval(state.commit.auto_commit_interval());
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch: Vec<DeliveryFrame> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            message = ws_rx.next() => {
                let text = match message {
                    None | Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Err(e)) => {
                        debug!("consumer socket read error: {e}");
                        return Ok(());
                    }
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                match serde_json::from_str::<AckFrame>(&text) {
                    Ok(ack) => {
                        if stack.acknowledge(&ack.ws_message_id).await? {
                            counter!("wsproxy_records_acknowledged_total").increment(1);
                        }
                    }
                    Err(e) => {
                        let refused = ProxyError::RequestValidation(
                            format!("malformed ack frame: {e}"),
                        );
                        if send_error(&mut ws_tx, &refused).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            _ = flush.tick() => {
                if send_frames(&mut ws_tx, &mut batch, batch_size > 1).await.is_err() {
                    return Ok(());
                }
                if auto_commit {
                    stack.sweep().await?;
                }
            }

            eviction = evictions.recv() => match eviction {
                Ok(Eviction { instance_id, .. }) if &instance_id == client_id => {
                    drop(
                        ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::POLICY,
                                reason: "session connection quota exceeded".into(),
                            })))
                            .await,
                    );
                    return Ok(());
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ProxyError::IncompleteOp(
                        "session registry stopped".to_string(),
                    ));
                }
            },

            // Only polled between WebSocket sends: peer backpressure stops
            // the Kafka poll loop rather than buffering without bound.
            fetched = next_record(consumer, limiter.as_ref()) => {
                let message = fetched.map_err(|e| ProxyError::Kafka(e.to_string()))?;
                let frame = delivery_frame(&message, params);
                stack.enqueue(frame.ws_message_id.clone()).await?;
                counter!("wsproxy_records_delivered_total").increment(1);
                batch.push(frame);
                if batch.len() >= batch_size
                    && send_frames(&mut ws_tx, &mut batch, batch_size > 1).await.is_err()
                {
                    return Ok(());
                }
            }
        }
    }
}

async fn next_record<'a>(
    consumer: &'a StreamConsumer,
    limiter: Option<&DeliveryLimiter>,
) -> rdkafka::error::KafkaResult<BorrowedMessage<'a>> {
    if let Some(limiter) = limiter {
        limiter.until_ready().await;
    }
    consumer.recv().await
}

fn delivery_frame(message: &BorrowedMessage<'_>, params: &ConsumerParams) -> DeliveryFrame {
    let timestamp = message.timestamp().to_millis().unwrap_or_else(now_ms);
    let key = message
        .key()
        .map(|key| decode_or_raw(params.key_format.unwrap_or(FormatType::Bytes), key));
    let value = match message.payload() {
        Some(payload) => decode_or_raw(params.val_format, payload),
        None => Value::Null,
    };
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| RecordHeader {
                    key: header.key.to_string(),
                    value: header
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    DeliveryFrame {
        ws_message_id: WsMessageId {
            topic: params.topic.clone(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp,
        },
        topic: params.topic.clone(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp,
        key,
        value,
        headers,
    }
}

/// A record that does not parse under the negotiated format is still
/// delivered (as base64) rather than wedging the stream behind it.
fn decode_or_raw(format: FormatType, bytes: &[u8]) -> Value {
    format
        .decode(bytes)
        .unwrap_or_else(|_| Value::String(BASE64_STANDARD.encode(bytes)))
}

async fn send_frames(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    batch: &mut Vec<DeliveryFrame>,
    grouped: bool,
) -> Result<(), axum::Error> {
    if batch.is_empty() {
        return Ok(());
    }
    if grouped {
        let body = serde_json::to_string(&batch).unwrap_or_default();
        batch.clear();
        ws_tx.send(Message::Text(body)).await
    } else {
        for frame in batch.drain(..) {
            let body = serde_json::to_string(&frame).unwrap_or_default();
            ws_tx.send(Message::Text(body)).await?;
        }
        Ok(())
    }
}

async fn send_error(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    error: &ProxyError,
) -> Result<(), axum::Error> {
    let body = serde_json::to_string(&ErrorMessage {
        message: error.to_string(),
    })
    .unwrap_or_default();
    ws_tx.send(Message::Text(body)).await
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
