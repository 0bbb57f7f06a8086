use std::net::SocketAddr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::session::ServerId;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Identity of this node in the session registry. Generated when unset,
    /// which is fine as long as restarts are allowed to look like new nodes.
    pub server_id: Option<String>,

    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    pub schema_registry_url: Option<String>,
    #[envconfig(default = "false")]
    pub auto_register_schemas: bool,

    #[envconfig(nested = true)]
    pub session: SessionStateConfig,

    #[envconfig(nested = true)]
    pub commit: CommitConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerDefaults,

    #[envconfig(nested = true)]
    pub basic_auth: BasicAuthConfig,

    #[envconfig(nested = true)]
    pub openid: OpenIdConfig,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,
    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,
    #[envconfig(default = "wsproxy")]
    pub otel_service_name: String,
}

impl Config {
    pub fn resolved_server_id(&self) -> ServerId {
        match &self.server_id {
            Some(id) if !id.trim().is_empty() => ServerId::new(id.trim().to_string()),
            _ => ServerId::new(format!("wsproxy-{}", uuid::Uuid::now_v7())),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_bootstrap_urls: String,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Envconfig, Clone)]
pub struct SessionStateConfig {
    #[envconfig(default = "_wsproxy.session.state")]
    pub session_state_topic_name: String,

    #[envconfig(default = "3")]
    pub session_state_replication_factor: i32,

    /// Delete-retention fallback on the compacted topic: 30 days.
    #[envconfig(default = "2592000000")]
    pub session_state_retention_ms: i64,

    #[envconfig(default = "3000")]
    pub session_rpc_timeout_ms: u64,

    #[envconfig(default = "64")]
    pub session_snapshot_interval: u32,

    /// Connection quota per consumer group; 0 disables the bound.
    #[envconfig(default = "1")]
    pub session_consumer_max_connections: u32,

    /// Connection quota per producer id; 0 disables the bound.
    #[envconfig(default = "1")]
    pub session_producer_max_connections: u32,
}

impl SessionStateConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.session_rpc_timeout_ms)
    }
}

#[derive(Envconfig, Clone)]
pub struct CommitConfig {
    #[envconfig(default = "100")]
    pub commit_max_stack_size: usize,

    #[envconfig(default = "true")]
    pub commit_auto_commit_enabled: bool,

    #[envconfig(default = "2000")]
    pub commit_auto_commit_interval_ms: u64,

    #[envconfig(default = "20000")]
    pub commit_auto_commit_max_age_ms: u64,
}

impl CommitConfig {
    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_auto_commit_interval_ms)
    }

    pub fn auto_commit_max_age(&self) -> Duration {
        Duration::from_millis(self.commit_auto_commit_max_age_ms)
    }
}

#[derive(Envconfig, Clone)]
pub struct ConsumerDefaults {
    /// Records per second per consumer socket; 0 disables the limit.
    #[envconfig(default = "0")]
    pub consumer_default_rate_limit: u32,

    #[envconfig(default = "1")]
    pub consumer_default_batch_size: usize,
}

#[derive(Envconfig, Clone)]
pub struct BasicAuthConfig {
    #[envconfig(default = "false")]
    pub basic_auth_enabled: bool,

    #[envconfig(default = "wsproxy")]
    pub basic_auth_realm: String,

    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<String>,
}

#[derive(Envconfig, Clone)]
pub struct OpenIdConfig {
    #[envconfig(default = "false")]
    pub openid_connect_enabled: bool,

    pub openid_connect_well_known_url: Option<String>,
    pub openid_connect_audience: Option<String>,
    pub openid_connect_realm: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_cover_a_local_run() {
        let config = Config::init_from_hashmap(&HashMap::new()).expect("defaults");
        assert_eq!(config.kafka.kafka_bootstrap_urls, "localhost:9092");
        assert_eq!(
            config.session.session_state_topic_name,
            "_wsproxy.session.state"
        );
        assert_eq!(config.session.session_state_replication_factor, 3);
        assert_eq!(config.session.rpc_timeout(), Duration::from_secs(3));
        assert_eq!(config.session.session_consumer_max_connections, 1);
        assert_eq!(config.session.session_producer_max_connections, 1);
        assert_eq!(config.commit.commit_max_stack_size, 100);
        assert!(config.commit.commit_auto_commit_enabled);
        assert_eq!(
            config.commit.auto_commit_max_age(),
            Duration::from_secs(20)
        );
        assert_eq!(config.consumer.consumer_default_batch_size, 1);
        assert!(!config.basic_auth.basic_auth_enabled);
        assert!(!config.openid.openid_connect_enabled);
    }

    #[test]
    fn server_id_falls_back_to_a_generated_one() {
        let mut env = HashMap::new();
        env.insert("SERVER_ID".to_string(), "node-7".to_string());
        let config = Config::init_from_hashmap(&env).expect("config");
        assert_eq!(config.resolved_server_id().as_str(), "node-7");

        let config = Config::init_from_hashmap(&HashMap::new()).expect("config");
        assert!(config.resolved_server_id().as_str().starts_with("wsproxy-"));
    }
}
