use std::future::ready;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use rdkafka::producer::FutureProducer;
use tower_http::trace::TraceLayer;

use crate::api::ErrorMessage;
use crate::auth::Authenticator;
use crate::config::{CommitConfig, Config, ConsumerDefaults, KafkaConfig, SessionStateConfig};
use crate::health::HealthRegistry;
use crate::kafka::KafkaContext;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::session::handler::SessionHandler;
use crate::socket;

#[derive(Clone)]
pub struct State {
    pub handler: SessionHandler,
    pub producer: FutureProducer<KafkaContext>,
    pub kafka: KafkaConfig,
    pub session: SessionStateConfig,
    pub commit: CommitConfig,
    pub consumer_defaults: ConsumerDefaults,
    pub auth: Arc<Authenticator>,
}

async fn index() -> &'static str {
    "wsproxy"
}

/// Unmatched routes get the same JSON error shape as everything else.
async fn fallback() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorMessage {
            message: "unmatched route".to_string(),
        }),
    )
}

pub fn router(
    liveness: HealthRegistry,
    handler: SessionHandler,
    producer: FutureProducer<KafkaContext>,
    auth: Authenticator,
    config: &Config,
    metrics: bool,
) -> Router {
    let state = State {
        handler,
        producer,
        kafka: config.kafka.clone(),
        session: config.session.clone(),
        commit: config.commit.clone(),
        consumer_defaults: config.consumer.clone(),
        auth: Arc::new(auth),
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/socket/in", get(socket::producer::socket_in))
        .route("/socket/out", get(socket::consumer::socket_out))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when wsproxy is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
