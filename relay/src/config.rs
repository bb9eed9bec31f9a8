use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::dedup::DedupConfig;
use crate::retry::RetryPolicy;

/// Service configuration, read from the environment once at startup.
///
/// Entries without a default are required; a missing one fails
/// `init_from_env` and the process exits before touching the broker.
#[derive(Envconfig, Clone)]
pub struct Config {
    /// Identifier this relay instance registers under, reported in logs so
    /// operators can tell instances apart.
    #[envconfig(from = "DEVICE_REGISTRY")]
    pub device_registry: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    /// Topic the admitted events are published to for internal consumers.
    #[envconfig(from = "EVENT_BUS_TOPIC")]
    pub event_bus_topic: String,

    /// First segment every inbound message key must carry.
    #[envconfig(from = "TOPIC_PREFIX", default = "devices")]
    pub topic_prefix: String,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "WAREHOUSE_TABLE", default = "device_telemetry")]
    pub warehouse_table: String,

    #[envconfig(from = "WAREHOUSE_MAX_CONNECTIONS", default = "8")]
    pub warehouse_max_connections: u32,

    #[envconfig(from = "OBJECT_STORAGE_BUCKET")]
    pub object_storage_bucket: String,

    #[envconfig(from = "OBJECT_STORAGE_REGION", default = "us-east-1")]
    pub object_storage_region: String,

    /// Set for S3-compatible stores (minio in dev); unset uses AWS proper.
    #[envconfig(from = "OBJECT_STORAGE_ENDPOINT")]
    pub object_storage_endpoint: Option<String>,

    #[envconfig(from = "OBJECT_STORAGE_PREFIX", default = "telemetry/")]
    pub object_storage_prefix: String,

    #[envconfig(from = "WORKER_COUNT", default = "4")]
    pub worker_count: usize,

    /// Upper bound on messages between broker receipt and ack. Reaching it
    /// stalls intake, which is the backpressure mechanism.
    #[envconfig(from = "MAX_IN_FLIGHT_MESSAGES", default = "256")]
    pub max_in_flight_messages: usize,

    #[envconfig(from = "COMMIT_INTERVAL_SECS", default = "5")]
    pub commit_interval_secs: u64,

    #[envconfig(from = "DEDUP_RETENTION_SECS", default = "300")]
    pub dedup_retention_secs: u64,

    #[envconfig(from = "DEDUP_MAX_ENTRIES_PER_DEVICE", default = "1024")]
    pub dedup_max_entries_per_device: usize,

    #[envconfig(from = "DEDUP_SWEEP_INTERVAL_SECS", default = "60")]
    pub dedup_sweep_interval_secs: u64,

    /// How many of each device's latest admitted events the status server
    /// keeps for display.
    #[envconfig(from = "RECENT_READINGS_PER_DEVICE", default = "100")]
    pub recent_readings_per_device: usize,

    #[envconfig(from = "SINK_MAX_ATTEMPTS", default = "5")]
    pub sink_max_attempts: u32,

    #[envconfig(from = "SINK_BASE_BACKOFF_MS", default = "100")]
    pub sink_base_backoff_ms: u64,

    #[envconfig(from = "SINK_MAX_BACKOFF_MS", default = "5000")]
    pub sink_max_backoff_ms: u64,

    /// How long shutdown waits for in-flight messages to drain before the
    /// process exits anyway and leaves them for redelivery.
    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sink_max_attempts.max(1),
            base_delay: Duration::from_millis(self.sink_base_backoff_ms),
            max_delay: Duration::from_millis(self.sink_max_backoff_ms),
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            retention: Duration::from_secs(self.dedup_retention_secs),
            max_entries_per_device: self.dedup_max_entries_per_device,
        }
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn dedup_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_sweep_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_HOSTS", default = "kafka:9092")]
    pub kafka_hosts: String,

    /// Topic carrying raw device telemetry.
    #[envconfig(from = "KAFKA_CONSUMER_TOPIC")]
    pub kafka_consumer_topic: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "telemetry-relay")]
    pub kafka_consumer_group: String,

    #[envconfig(from = "KAFKA_CONSUMER_OFFSET_RESET", default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    /// When set, connections use SSL with this CA bundle.
    #[envconfig(from = "KAFKA_TLS_CA_LOCATION")]
    pub kafka_tls_ca_location: Option<String>,

    #[envconfig(from = "KAFKA_PRODUCER_LINGER_MS", default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(from = "KAFKA_MESSAGE_TIMEOUT_MS", default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(from = "KAFKA_COMPRESSION_CODEC", default = "snappy")]
    pub kafka_compression_codec: String,

    #[envconfig(from = "KAFKA_SEND_TIMEOUT_MS", default = "5000")]
    pub kafka_send_timeout_ms: u64,
}

impl KafkaConfig {
    /// Consumer options. Auto-commit stays off; only offsets whose outcome
    /// is determined are committed, by the consumer loop itself.
    pub fn consumer_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("group.id", &self.kafka_consumer_group)
            .set("auto.offset.reset", &self.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");
        self.apply_tls(&mut client_config);
        client_config
    }

    pub fn producer_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &self.kafka_compression_codec);
        self.apply_tls(&mut client_config);
        client_config
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_send_timeout_ms)
    }

    fn apply_tls(&self, client_config: &mut ClientConfig) {
        if let Some(ca) = &self.kafka_tls_ca_location {
            client_config
                .set("security.protocol", "ssl")
                .set("ssl.ca.location", ca);
        }
    }
}
