//! 发布进程运行配置加载。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 传输协议类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// MQTT 3.1.1，断线后自动重连
    Mqtt,
    /// MQTT 3.1.1，断线即结束发布循环
    MqttLegacy,
    /// MQTT 5，支持命令/响应
    Mqtt5,
    /// Kafka 生产者
    Kafka,
}

/// 负载计算策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadPolicyKind {
    /// 累加电能表：发布历史读数之和
    Accumulate,
    /// 即时值
    Gauge,
}

/// Variant 编码方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantEncodingKind {
    Reversible,
    Plain,
}

/// 数据源类型。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Fixture { path: String },
    Tcp {
        host: String,
        port: u16,
        request: Option<String>,
    },
}

/// 发布进程运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub transport: TransportKind,
    pub broker_host: String,
    pub broker_port: u16,
    pub tls: bool,
    pub client_id: String,
    pub shared_key: Option<String>,
    pub sas_policy: Option<String>,
    pub sas_validity_seconds: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub telemetry_topic: String,
    pub command_namespace: String,
    pub kafka_connection_string: Option<String>,
    pub publisher_id: String,
    pub writer_id: String,
    pub payload_field: String,
    pub payload_policy: PayloadPolicyKind,
    pub variant_encoding: VariantEncodingKind,
    pub source: SourceKind,
    pub interval_ms: u64,
    pub max_iterations: Option<u64>,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_attempts: Option<u32>,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let transport = read_transport("PUBSUB_TRANSPORT")?;
        let broker_host = read_required("PUBSUB_BROKER_HOST")?;
        let default_port = match transport {
            TransportKind::Kafka => 9093,
            _ => 8883,
        };
        let broker_port = read_u16_with_default("PUBSUB_BROKER_PORT", default_port)?;
        let tls = read_bool_with_default("PUBSUB_TLS", true);
        let client_id = read_required("PUBSUB_CLIENT_ID")?;
        let shared_key = read_optional("PUBSUB_SHARED_KEY");
        let sas_policy = read_optional("PUBSUB_SAS_POLICY");
        let sas_validity_seconds =
            read_u64_with_default("PUBSUB_SAS_VALIDITY_SECONDS", 7 * 24 * 60 * 60)?;
        if sas_validity_seconds == 0 {
            return Err(ConfigError::Invalid(
                "PUBSUB_SAS_VALIDITY_SECONDS".to_string(),
                "0".to_string(),
            ));
        }
        let username = read_optional("PUBSUB_USERNAME");
        let password = read_optional("PUBSUB_PASSWORD");
        let telemetry_topic = env::var("PUBSUB_TELEMETRY_TOPIC")
            .unwrap_or_else(|_| format!("devices/{}/messages/events/", client_id));
        let command_namespace =
            env::var("PUBSUB_COMMAND_NAMESPACE").unwrap_or_else(|_| client_id.clone());
        let kafka_connection_string = read_optional("PUBSUB_KAFKA_CONNECTION_STRING");
        let publisher_id = env::var("PUBSUB_PUBLISHER_ID").unwrap_or_else(|_| client_id.clone());
        let writer_id = env::var("PUBSUB_WRITER_ID").unwrap_or_else(|_| "1".to_string());
        let payload_field =
            env::var("PUBSUB_PAYLOAD_FIELD").unwrap_or_else(|_| "Energy".to_string());
        let payload_policy = read_payload_policy("PUBSUB_PAYLOAD_POLICY")?;
        let variant_encoding = read_variant_encoding("PUBSUB_VARIANT_ENCODING")?;
        let source = read_source()?;
        let interval_ms = read_u64_with_default("PUBSUB_INTERVAL_MS", 1000)?;
        let max_iterations = read_optional_u64("PUBSUB_MAX_ITERATIONS")?;
        let reconnect_delay_ms = read_u64_with_default("PUBSUB_RECONNECT_DELAY_MS", 5000)?;
        let reconnect_max_attempts = read_optional_u64("PUBSUB_RECONNECT_MAX_ATTEMPTS")?
            .map(|value| {
                u32::try_from(value).map_err(|_| {
                    ConfigError::Invalid(
                        "PUBSUB_RECONNECT_MAX_ATTEMPTS".to_string(),
                        value.to_string(),
                    )
                })
            })
            .transpose()?;
        let connect_timeout_ms = read_u64_with_default("PUBSUB_CONNECT_TIMEOUT_MS", 10_000)?;
        let publish_timeout_ms = read_u64_with_default("PUBSUB_PUBLISH_TIMEOUT_MS", 10_000)?;

        Ok(Self {
            transport,
            broker_host,
            broker_port,
            tls,
            client_id,
            shared_key,
            sas_policy,
            sas_validity_seconds,
            username,
            password,
            telemetry_topic,
            command_namespace,
            kafka_connection_string,
            publisher_id,
            writer_id,
            payload_field,
            payload_policy,
            variant_encoding,
            source,
            interval_ms,
            max_iterations,
            reconnect_delay_ms,
            reconnect_max_attempts,
            connect_timeout_ms,
            publish_timeout_ms,
        })
    }

    /// 是否由连接层自动重连。
    pub fn auto_reconnect(&self) -> bool {
        matches!(self.transport, TransportKind::Mqtt | TransportKind::Mqtt5)
    }
}

fn read_source() -> Result<SourceKind, ConfigError> {
    let kind = env::var("PUBSUB_SOURCE").unwrap_or_else(|_| "fixture".to_string());
    match kind.to_ascii_lowercase().as_str() {
        "fixture" | "file" => Ok(SourceKind::Fixture {
            path: env::var("PUBSUB_FIXTURE_PATH").unwrap_or_else(|_| "energy.csv".to_string()),
        }),
        "tcp" => Ok(SourceKind::Tcp {
            host: read_required("PUBSUB_SOURCE_HOST")?,
            port: read_u16_required("PUBSUB_SOURCE_PORT")?,
            request: read_optional("PUBSUB_SOURCE_REQUEST"),
        }),
        _ => Err(ConfigError::Invalid("PUBSUB_SOURCE".to_string(), kind)),
    }
}

fn read_transport(key: &str) -> Result<TransportKind, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(TransportKind::Mqtt),
    };
    match value.to_ascii_lowercase().as_str() {
        "mqtt" => Ok(TransportKind::Mqtt),
        "mqtt-legacy" | "mqtt_legacy" => Ok(TransportKind::MqttLegacy),
        "mqtt5" => Ok(TransportKind::Mqtt5),
        "kafka" => Ok(TransportKind::Kafka),
        _ => Err(ConfigError::Invalid(key.to_string(), value)),
    }
}

fn read_payload_policy(key: &str) -> Result<PayloadPolicyKind, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(PayloadPolicyKind::Accumulate),
    };
    match value.to_ascii_lowercase().as_str() {
        "accumulate" | "meter" => Ok(PayloadPolicyKind::Accumulate),
        "gauge" => Ok(PayloadPolicyKind::Gauge),
        _ => Err(ConfigError::Invalid(key.to_string(), value)),
    }
}

fn read_variant_encoding(key: &str) -> Result<VariantEncodingKind, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(VariantEncodingKind::Reversible),
    };
    match value.to_ascii_lowercase().as_str() {
        "reversible" => Ok(VariantEncodingKind::Reversible),
        "plain" => Ok(VariantEncodingKind::Plain),
        _ => Err(ConfigError::Invalid(key.to_string(), value)),
    }
}

fn read_required(key: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key.to_string())),
    }
}

fn read_u16_required(key: &str) -> Result<u16, ConfigError> {
    let value = read_required(key)?;
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_optional_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        Err(_) => Ok(None),
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
