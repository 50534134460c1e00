use crate::{DeliveryQos, InboundCommand, OutboundMessage};
use async_trait::async_trait;
use serde_json::Value;

/// 命令处理成功时响应携带的状态码。
pub const STATUS_SUCCESS: u16 = 200;
/// 处理器返回错误时的状态码。
pub const STATUS_FAILURE: u16 = 500;
/// 响应状态码所在的属性名。
pub const STATUS_PROPERTY: &str = "status";

const JSON_CONTENT_TYPE: &str = "application/json";

/// 命令处理器返回的错误。
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// 入站命令处理器，返回值作为响应 JSON 正文。
///
/// 每条命令在独立任务中执行，慢处理器不会阻塞后续命令的接收。
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &InboundCommand) -> Result<Value, HandlerError>;
}

/// 默认处理器：确认收到并返回空对象。
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeHandler;

#[async_trait]
impl CommandHandler for AcknowledgeHandler {
    async fn handle(&self, _command: &InboundCommand) -> Result<Value, HandlerError> {
        Ok(Value::Object(Default::default()))
    }
}

/// 命令订阅过滤器：`<ns>/methods/+`。
pub fn methods_filter(namespace: &str) -> String {
    format!("{}/methods/+", namespace.trim_end_matches('/'))
}

/// 响应发布 topic：`<ns>/responses`。
pub fn responses_topic(namespace: &str) -> String {
    format!("{}/responses", namespace.trim_end_matches('/'))
}

/// 从 `<ns>/methods/<name>` 中取出方法名。
pub(crate) fn command_name(topic: &str) -> String {
    topic
        .rsplit_once("/methods/")
        .map(|(_, name)| name)
        .unwrap_or(topic)
        .to_string()
}

/// 构造与命令关联的响应：回显关联数据，附带状态码。
pub fn build_response(command: &InboundCommand, status: u16, body: &Value) -> OutboundMessage {
    OutboundMessage {
        topic: command.response_topic.clone(),
        payload: body.to_string().into_bytes(),
        qos: DeliveryQos::AtLeastOnce,
        content_type: Some(JSON_CONTENT_TYPE.to_string()),
        correlation_data: command.correlation_data.clone(),
        properties: vec![(STATUS_PROPERTY.to_string(), status.to_string())],
    }
}
