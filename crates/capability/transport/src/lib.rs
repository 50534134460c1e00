//! # 传输连接能力模块
//!
//! 管理到 broker 的单条出站会话：建立连接（附带凭据）、发布信封、感知断线、
//! 按固定退避重连，以及（支持的协议下）处理入站命令并回发响应。
//!
//! ## 架构设计
//!
//! ```text
//! Publish Loop
//!       │ publish / disconnect
//!       ▼
//! Connection ──── 状态机：Disconnected → Connecting → Connected → Disconnected …
//!       │              │
//!       │              ├── 重连监督任务（固定延迟，同一时刻至多一个）
//!       │              └── 命令任务集（每条命令一个任务，关闭时等待完成）
//!       ▼
//! Link（线上协议）
//!       ├── MqttLink   （MQTT 3.1.1）
//!       ├── Mqtt5Link  （MQTT 5，命令/响应）
//!       ├── KafkaLink  （`kafka` 特性）
//!       └── MemoryLink （测试与本地演示）
//! ```
//!
//! Link 只负责单次会话：`open` 成功后，会话内的断线通过 `LinkEvents` 恰好上报一次，
//! 之后不再自行重连；是否以及何时重连由 `Connection` 决定。

mod command;
mod connection;
#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod mqtt;
mod mqtt5;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use pubsub_auth::{Credential, CredentialError};
use tokio::sync::mpsc;

pub use command::{
    AcknowledgeHandler, CommandHandler, HandlerError, STATUS_FAILURE, STATUS_PROPERTY,
    STATUS_SUCCESS, build_response, methods_filter, responses_topic,
};
pub use connection::{Connection, ConnectionConfig, ConnectionState, DisconnectEvent};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaLink, KafkaLinkConfig};
pub use memory::MemoryLink;
pub use mqtt::{MqttLink, MqttLinkConfig, iot_hub_username};
pub use mqtt5::{Mqtt5Link, Mqtt5LinkConfig};

/// 遥测消息的创建时间属性名。
pub const CREATION_TIME_PROPERTY: &str = "iothub-creation-time-utc";
/// 内容编码属性名。
pub const CONTENT_ENCODING_PROPERTY: &str = "iothub-content-encoding";

/// 传输错误。
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("connect rejected: {reason}")]
    Connect {
        reason: String,
        properties: Vec<(String, String)>,
    },
    #[error("publish failed: {reason}")]
    Publish { reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    pub(crate) fn connect(reason: impl Into<String>) -> Self {
        Self::Connect {
            reason: reason.into(),
            properties: Vec::new(),
        }
    }

    pub(crate) fn publish(reason: impl Into<String>) -> Self {
        Self::Publish {
            reason: reason.into(),
        }
    }
}

/// 投递保证级别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryQos {
    AtMostOnce,
    /// 遥测固定使用至少一次
    #[default]
    AtLeastOnce,
}

/// 一条待发布的消息（信封正文 + 传输层元数据）。
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: DeliveryQos,
    pub content_type: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    /// 自定义属性（MQTT 5 user properties / Kafka headers）
    pub properties: Vec<(String, String)>,
}

impl OutboundMessage {
    /// 构造遥测消息：至少一次投递，附带内容类型与创建时间。
    pub fn telemetry(topic: impl Into<String>, envelope: String, content_type: &str) -> Self {
        Self {
            topic: topic.into(),
            payload: envelope.into_bytes(),
            qos: DeliveryQos::AtLeastOnce,
            content_type: Some(content_type.to_string()),
            correlation_data: None,
            properties: vec![
                (
                    CREATION_TIME_PROPERTY.to_string(),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                ),
                (CONTENT_ENCODING_PROPERTY.to_string(), "utf-8".to_string()),
            ],
        }
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// 入站命令（方法调用）。
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCommand {
    pub topic: String,
    /// 方法名（topic 最后一段）
    pub name: String,
    pub payload: Vec<u8>,
    pub correlation_data: Option<Vec<u8>>,
    /// 响应发布的目标 topic
    pub response_topic: String,
    pub properties: Vec<(String, String)>,
}

/// Link 会话内产生的事件。
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Disconnected { reason: String },
    Command(InboundCommand),
}

/// 会话事件发送端，携带会话序号以便丢弃过期会话的断线通知。
#[derive(Debug, Clone)]
pub struct LinkEvents {
    session: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEvents {
    pub(crate) fn new(session: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// 上报断线（每个会话只应调用一次）。
    pub fn disconnected(&self, reason: impl Into<String>) {
        let _ = self.tx.send((
            self.session,
            LinkEvent::Disconnected {
                reason: reason.into(),
            },
        ));
    }

    pub fn command(&self, command: InboundCommand) {
        let _ = self.tx.send((self.session, LinkEvent::Command(command)));
    }
}

/// 线上协议会话抽象。
#[async_trait]
pub trait Link: Send + Sync {
    /// 协议名（用于日志）。
    fn name(&self) -> &'static str;

    /// 是否订阅并处理入站命令。
    fn supports_commands(&self) -> bool {
        false
    }

    /// 建立新会话；已有会话会先被丢弃。不在内部重试。
    async fn open(
        &self,
        credential: Option<&Credential>,
        events: LinkEvents,
    ) -> Result<(), TransportError>;

    /// 发布一条消息。
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// 关闭会话并释放资源；显式关闭不产生断线事件。
    async fn close(&self) -> Result<(), TransportError>;
}
