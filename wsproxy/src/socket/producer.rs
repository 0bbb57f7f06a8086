//! `/socket/in`: a long-lived WebSocket publishing records to one topic.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use metrics::counter;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::api::{rejection_for, ErrorMessage, ProxyError};
use crate::frames::{FormatType, ProducerAck, ProducerFrame};
use crate::kafka::{self, KafkaContext};
use crate::router;
use crate::session::handler::{session_id_of, Eviction};
use crate::session::{FullClientId, FullProducerId, SessionKind};
use crate::socket::params::ProducerParams;
use crate::socket::Registration;

#[instrument(skip_all)]
pub async fn socket_in(
    state: State<router::State>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ProxyError> {
    state.auth.authenticate(&headers).await?;
    let params = ProducerParams::parse(query.as_deref().unwrap_or(""))?;
    if !kafka::topic_exists(&state.producer, &params.topic).await? {
        return Err(ProxyError::TopicNotFound(params.topic));
    }

    let full_id = FullProducerId::new(params.client_id.clone(), params.instance_id.clone());
    let client_id = FullClientId::Producer(full_id.clone());
    let session_id = session_id_of(&client_id);

    let init = state
        .handler
        .init_session(
            session_id.clone(),
            SessionKind::Producer,
            state.session.session_producer_max_connections,
            None,
        )
        .await;
    if !init.is_success() {
        return Err(rejection_for(&session_id, &init));
    }

    let added = state
        .handler
        .add_producer(full_id, state.handler.server_id().clone())
        .await;
    if !added.is_success() {
        counter!("wsproxy_sockets_rejected_total", "kind" => "producer").increment(1);
        return Err(rejection_for(&session_id, &added));
    }

    info!(instance = %client_id, topic = %params.topic, "producer socket opened");
    counter!("wsproxy_sockets_opened_total", "kind" => "producer").increment(1);

    let state = state.0.clone();
    let evictions = state.handler.subscribe_evictions();
    Ok(ws.on_upgrade(move |socket| run(socket, state, params, client_id, evictions)))
}

async fn run(
    socket: WebSocket,
    state: router::State,
    params: ProducerParams,
    client_id: FullClientId,
    evictions: broadcast::Receiver<Eviction>,
) {
    let mut registration = Registration::new(state.handler.clone(), client_id.clone());
    if let Err(e) = drive(socket, &state.producer, &params, &client_id, evictions).await {
        warn!(instance = %client_id, "producer socket failed: {e}");
    }
    registration.deregister().await;
    counter!("wsproxy_sockets_closed_total", "kind" => "producer").increment(1);
}

async fn drive(
    mut socket: WebSocket,
    producer: &FutureProducer<KafkaContext>,
    params: &ProducerParams,
    client_id: &FullClientId,
    mut evictions: broadcast::Receiver<Eviction>,
) -> Result<(), ProxyError> {
    loop {
        tokio::select! {
            message = socket.recv() => {
                let text = match message {
                    None | Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Err(e)) => {
                        debug!("producer socket read error: {e}");
                        return Ok(());
                    }
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(_))) => {
                        let refused = ProxyError::RequestValidation(
                            "binary frames are not supported".to_string(),
                        );
                        if send_error(&mut socket, &refused).await.is_err() {
                            return Ok(());
                        }
                        continue;
                    }
                    // Pings and pongs are answered by the protocol layer.
                    Some(Ok(_)) => continue,
                };

                match publish_frame(producer, params, &text).await {
                    Ok(ack) => {
                        counter!("wsproxy_records_produced_total").increment(1);
                        let body = serde_json::to_string(&ack)
                            .map_err(|e| ProxyError::Kafka(e.to_string()))?;
                        if socket.send(Message::Text(body)).await.is_err() {
                            return Ok(());
                        }
                    }
                    // Bad frames and broker hiccups are reported in-band;
                    // the socket itself stays up.
                    Err(e) => {
                        if send_error(&mut socket, &e).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            eviction = evictions.recv() => match eviction {
                Ok(Eviction { instance_id, .. }) if &instance_id == client_id => {
                    drop(
                        socket
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
        }
    }
}

async fn publish_frame(
    producer: &FutureProducer<KafkaContext>,
    params: &ProducerParams,
    text: &str,
) -> Result<ProducerAck, ProxyError> {
    let frame: ProducerFrame = serde_json::from_str(text)
        .map_err(|e| ProxyError::RequestValidation(format!("malformed frame: {e}")))?;

    let payload = params.val_format.encode(&frame.value)?;
    // Client-supplied key format is honored; without one the key passes
    // through as raw bytes.
    let key = frame
        .key
        .as_ref()
        .map(|key| params.key_format.unwrap_or(FormatType::Bytes).encode(key))
        .transpose()?;

    let mut headers = OwnedHeaders::new();
    for header in &frame.headers {
        headers = headers.insert(Header {
            key: &header.key,
            value: Some(header.value.as_bytes()),
        });
    }

    let delivery = producer
        .send_result(FutureRecord {
            topic: params.topic.as_str(),
            payload: Some(&payload),
            partition: None,
            key: key.as_deref(),
            timestamp: None,
            headers: Some(headers),
        })
        .map_err(|(e, _)| ProxyError::Kafka(e.to_string()))?;

    match delivery.await {
        Ok(Ok((partition, offset))) => Ok(ProducerAck {
            topic: params.topic.clone(),
            partition,
            offset,
            timestamp: now_ms(),
            message_id: frame.message_id,
        }),
        Ok(Err((e, _))) => Err(ProxyError::Kafka(e.to_string())),
        Err(canceled) => Err(ProxyError::Kafka(canceled.to_string())),
    }
}

async fn send_error(socket: &mut WebSocket, error: &ProxyError) -> Result<(), axum::Error> {
    let body = serde_json::to_string(&ErrorMessage {
        message: error.to_string(),
    })
    .unwrap_or_default();
    socket.send(Message::Text(body)).await
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
