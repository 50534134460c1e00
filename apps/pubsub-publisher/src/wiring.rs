//! 发布链路装配模块
//!
//! 把运行配置翻译为各能力模块的参数：凭据生成器、线上协议链路、连接状态机、
//! 发布循环。协议相关的差异（是否自动重连、凭据方案、命令通道）集中在这里决定。

use envelope::VariantEncoding;
use pubsub_auth::{CredentialError, CredentialProvider, SasScheme, SasTokenGenerator};
use pubsub_config::{AppConfig, PayloadPolicyKind, TransportKind, VariantEncodingKind};
use pubsub_pipeline::{PayloadPolicy, PublishLoopConfig};
use pubsub_source::{TcpLineConfig, TcpLineSource};
use pubsub_transport::{
    AcknowledgeHandler, Connection, ConnectionConfig, Link, Mqtt5Link, Mqtt5LinkConfig, MqttLink,
    MqttLinkConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 装配错误。
#[derive(Debug, thiserror::Error)]
pub enum WiringError {
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("unsupported transport: {0}")]
    Unsupported(String),
}

/// 配置了共享密钥时创建 SAS 凭据生成器；MQTT 5 使用增强认证方案。
pub fn credential_provider(
    config: &AppConfig,
) -> Result<Option<Arc<dyn CredentialProvider>>, CredentialError> {
    let Some(shared_key) = config.shared_key.as_deref() else {
        return Ok(None);
    };
    let scheme = match config.transport {
        TransportKind::Mqtt5 => SasScheme::Mqtt5,
        _ => SasScheme::Legacy,
    };
    let generator = SasTokenGenerator::new(
        config.broker_host.clone(),
        config.client_id.clone(),
        shared_key,
        Duration::from_secs(config.sas_validity_seconds),
        scheme,
    )?
    .with_policy(config.sas_policy.clone().unwrap_or_default());
    info!(
        target: "pubsub.auth",
        client_id = %config.client_id,
        scheme = ?scheme,
        validity_seconds = config.sas_validity_seconds,
        "credential_provider_ready"
    );
    Ok(Some(Arc::new(generator)))
}

fn mqtt_link_config(config: &AppConfig) -> MqttLinkConfig {
    let mut mqtt = MqttLinkConfig::new(
        config.broker_host.clone(),
        config.broker_port,
        config.client_id.clone(),
    );
    mqtt.tls = config.tls;
    mqtt.username = config.username.clone();
    mqtt.password = config.password.clone();
    mqtt
}

/// 按传输类型创建线上协议链路。
pub fn build_link(config: &AppConfig) -> Result<Arc<dyn Link>, WiringError> {
    match config.transport {
        TransportKind::Mqtt | TransportKind::MqttLegacy => {
            Ok(Arc::new(MqttLink::new(mqtt_link_config(config))))
        }
        TransportKind::Mqtt5 => Ok(Arc::new(Mqtt5Link::new(Mqtt5LinkConfig {
            mqtt: mqtt_link_config(config),
            command_namespace: Some(config.command_namespace.clone()),
        }))),
        TransportKind::Kafka => kafka_link(config),
    }
}

#[cfg(feature = "kafka")]
fn kafka_link(config: &AppConfig) -> Result<Arc<dyn Link>, WiringError> {
    let mut kafka = pubsub_transport::KafkaLinkConfig::new(
        config.broker_host.clone(),
        config.broker_port,
        config.client_id.clone(),
    );
    kafka.connection_string = config.kafka_connection_string.clone();
    kafka.message_timeout = Duration::from_millis(config.publish_timeout_ms);
    Ok(Arc::new(pubsub_transport::KafkaLink::new(kafka)))
}

#[cfg(not(feature = "kafka"))]
fn kafka_link(_config: &AppConfig) -> Result<Arc<dyn Link>, WiringError> {
    Err(WiringError::Unsupported(
        "kafka (rebuild with `--features kafka`)".to_string(),
    ))
}

pub fn connection_config(config: &AppConfig) -> ConnectionConfig {
    ConnectionConfig {
        client_id: config.client_id.clone(),
        auto_reconnect: config.auto_reconnect(),
        reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        max_reconnect_attempts: config.reconnect_max_attempts,
        connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        ..ConnectionConfig::default()
    }
}

/// 组装连接：凭据 + 链路 + 状态机，命令通道挂上默认处理器。
pub fn build_connection(config: &AppConfig) -> Result<Connection, WiringError> {
    let credentials = credential_provider(config)?;
    if credentials.is_none() && config.password.is_none() && config.kafka_connection_string.is_none() {
        warn!(
            target: "pubsub.auth",
            client_id = %config.client_id,
            "connecting_without_credentials"
        );
    }
    let link = build_link(config)?;
    let supports_commands = link.supports_commands();
    let connection = Connection::new(link, credentials, connection_config(config));
    if supports_commands {
        connection.on_command(Arc::new(AcknowledgeHandler));
    }
    Ok(connection)
}

pub fn loop_config(config: &AppConfig) -> PublishLoopConfig {
    PublishLoopConfig {
        publisher_id: config.publisher_id.clone(),
        writer_id: config.writer_id.clone(),
        payload_field: config.payload_field.clone(),
        topic: config.telemetry_topic.clone(),
        interval: Duration::from_millis(config.interval_ms),
        max_iterations: config.max_iterations,
        policy: match config.payload_policy {
            PayloadPolicyKind::Accumulate => PayloadPolicy::Accumulate,
            PayloadPolicyKind::Gauge => PayloadPolicy::Gauge,
        },
        encoding: match config.variant_encoding {
            VariantEncodingKind::Reversible => VariantEncoding::Reversible,
            VariantEncodingKind::Plain => VariantEncoding::Plain,
        },
    }
}

pub fn tcp_source(host: &str, port: u16, request: Option<String>) -> TcpLineSource {
    TcpLineSource::new(TcpLineConfig {
        host: host.to_string(),
        port,
        request_command: request,
        ..TcpLineConfig::default()
    })
}
