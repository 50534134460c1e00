//! 遥测信封（网络消息）编码。
//!
//! 输出结构固定且有序：
//!
//! ```text
//! {
//!   "MessageId": "<计数>",
//!   "MessageType": "ua-data",
//!   "PublisherId": "<发布者>",
//!   "Messages": [
//!     { "DataSetWriterId": "<通道>", "Timestamp": "<UTC>", "Payload": { "<字段>": <值>, ... } }
//!   ]
//! }
//! ```
//!
//! 下游可能以流式方式增量解析，因此字段顺序属于契约的一部分。

mod encoder;

use chrono::{DateTime, Utc};
use domain::PayloadValue;

pub use encoder::{JsonEncoder, VariantEncoding};

/// 一次性数据消息的 MessageType。
pub const MESSAGE_TYPE_DATA: &str = "ua-data";
/// 信封的内容类型。
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Timestamp 文本格式（可排序、带 UTC 标记，与区域设置无关）。
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

/// 信封编码错误。
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("field name required inside a structure")]
    MissingFieldName,
    #[error("field name not allowed inside an array: {0}")]
    UnexpectedFieldName(String),
    #[error("scope mismatch: expected {expected}, found {found}")]
    ScopeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("cannot pop the root structure")]
    ScopeUnderflow,
    #[error("{0} scope(s) left open")]
    UnclosedScopes(usize),
    #[error("encoder already closed")]
    Closed,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 数据集消息：一个写入通道在某一时刻的一组字段。
#[derive(Debug, Clone, PartialEq)]
pub struct DataSetMessage {
    pub writer_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<(String, PayloadValue)>,
}

/// 网络消息（信封）。
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMessage {
    pub message_id: String,
    pub publisher_id: String,
    pub messages: Vec<DataSetMessage>,
}

impl NetworkMessage {
    /// 单数据集消息的便捷构造。
    pub fn single(
        counter: u64,
        publisher_id: impl Into<String>,
        message: DataSetMessage,
    ) -> Self {
        Self {
            message_id: counter.to_string(),
            publisher_id: publisher_id.into(),
            messages: vec![message],
        }
    }

    /// 编码为信封文本。
    pub fn encode(&self, encoding: VariantEncoding) -> Result<String, EncodeError> {
        let mut encoder = JsonEncoder::new(encoding);
        encoder.write_string(Some("MessageId"), &self.message_id)?;
        encoder.write_string(Some("MessageType"), MESSAGE_TYPE_DATA)?;
        encoder.write_string(Some("PublisherId"), &self.publisher_id)?;
        encoder.push_array(Some("Messages"))?;
        for message in &self.messages {
            encoder.push_structure(None)?;
            encoder.write_string(Some("DataSetWriterId"), &message.writer_id)?;
            encoder.write_string(Some("Timestamp"), &format_timestamp(&message.timestamp))?;
            encoder.push_structure(Some("Payload"))?;
            for (name, value) in &message.payload {
                encoder.write_variant(Some(name), value)?;
            }
            encoder.pop_structure()?;
            encoder.pop_structure()?;
        }
        encoder.pop_array()?;
        encoder.close_and_return_text()
    }
}

/// 由单次读数直接编码信封。
pub fn encode(
    counter: u64,
    publisher_id: &str,
    writer_id: &str,
    timestamp: DateTime<Utc>,
    payload: Vec<(String, PayloadValue)>,
    encoding: VariantEncoding,
) -> Result<String, EncodeError> {
    let message = DataSetMessage {
        writer_id: writer_id.to_string(),
        timestamp,
        payload,
    };
    NetworkMessage::single(counter, publisher_id, message).encode(encoding)
}

/// 按固定格式输出 UTC 时间戳，例如 `2024-01-02 03:04:05Z`。
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}
