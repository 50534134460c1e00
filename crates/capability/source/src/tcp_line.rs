//! TCP 行协议数据源
//!
//! 主动连接设备，每次取数时发送请求命令（可选）并读取一行响应。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let config = TcpLineConfig {
//!     host: "192.168.1.100".to_string(),
//!     port: 9000,
//!     request_command: Some("READ".to_string()),
//!     ..TcpLineConfig::default()
//! };
//! let mut source = TcpLineSource::new(config);
//! let reading = source.next_reading().await?;
//! ```

use crate::{DataSource, SourceError, now_epoch_ms};
use async_trait::async_trait;
use domain::Reading;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

/// TCP 行协议数据源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpLineConfig {
    /// 服务器主机地址
    pub host: String,
    /// 服务器端口
    pub port: u16,
    /// 请求命令（可选，用于主动请求数据）
    pub request_command: Option<String>,
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 读取超时（毫秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    5000
}

impl Default for TcpLineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            request_command: None,
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// TCP 行协议数据源，连接断开后在下一次取数时重新连接。
pub struct TcpLineSource {
    config: TcpLineConfig,
    session: Option<Session>,
    polls: u64,
}

impl TcpLineSource {
    pub fn new(config: TcpLineConfig) -> Self {
        Self {
            config,
            session: None,
            polls: 0,
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: TcpLineConfig = serde_json::from_str(json)?;
        Ok(Self::new(config))
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn connect(&self) -> Result<Session, SourceError> {
        let addr = self.addr();
        let stream = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| SourceError::Timeout(format!("connect {}", addr)))?
        .map_err(|err| SourceError::Connection(format!("{}: {}", addr, err)))?;
        info!(target: "pubsub.source", addr = %addr, "tcp_source_connected");
        let (reader, writer) = stream.into_split();
        Ok(Session {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn poll(&mut self) -> Result<String, SourceError> {
        if self.session.is_none() {
            self.session = Some(self.connect().await?);
        }
        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);
        let request = self.config.request_command.clone();
        let Some(session) = self.session.as_mut() else {
            return Err(SourceError::Connection("no session".to_string()));
        };

        if let Some(cmd) = request {
            let line = if cmd.ends_with('\n') {
                cmd.clone()
            } else {
                format!("{}\n", cmd)
            };
            session.writer.write_all(line.as_bytes()).await?;
            session.writer.flush().await?;
            debug!(target: "pubsub.source", command = %cmd, "sent request command");
        }

        let mut response = String::new();
        match tokio::time::timeout(read_timeout, session.reader.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(SourceError::Connection("connection closed".to_string())),
            Ok(Ok(_)) => Ok(response.trim().to_string()),
            Ok(Err(err)) => Err(SourceError::Io(err)),
            Err(_) => Err(SourceError::Timeout("read".to_string())),
        }
    }
}

#[async_trait]
impl DataSource for TcpLineSource {
    async fn next_reading(&mut self) -> Result<Reading, SourceError> {
        match self.poll().await {
            Ok(line) => {
                let raw = extract_numeric(&line)
                    .map(|value| value.to_string())
                    .unwrap_or(line);
                let index = self.polls;
                self.polls += 1;
                Ok(Reading::new(self.addr(), index, raw, now_epoch_ms()))
            }
            Err(err) => {
                // 丢弃会话，下次取数时重连
                if self.session.take().is_some() {
                    warn!(target: "pubsub.source", addr = %self.addr(), error = %err, "tcp_source_reset");
                }
                Err(err)
            }
        }
    }
}

/// 从响应文本中提取数值。
///
/// 支持三种格式：纯数值、`{"value": 123.45}`、`key=value`。
pub fn extract_numeric(data: &str) -> Option<f64> {
    let data = data.trim();
    if let Ok(value) = data.parse::<f64>() {
        return Some(value);
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
        if let Some(value) = json.get("value").and_then(|v| v.as_f64()) {
            return Some(value);
        }
    }

    for part in data.split(['=', ':', ',']) {
        if let Ok(value) = part.trim().parse::<f64>() {
            return Some(value);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_with_defaults() {
        let json = r#"{
            "host": "192.168.1.100",
            "port": 8080,
            "request_command": "READ"
        }"#;
        let source = TcpLineSource::from_json(json).expect("config");
        assert_eq!(source.config.host, "192.168.1.100");
        assert_eq!(source.config.port, 8080);
        assert_eq!(source.config.request_command, Some("READ".to_string()));
        assert_eq!(source.config.read_timeout_ms, 5000);
    }

    #[test]
    fn extract_numeric_formats() {
        assert_eq!(extract_numeric("123.45"), Some(123.45));
        assert_eq!(extract_numeric(r#"{"value": 42.0}"#), Some(42.0));
        assert_eq!(extract_numeric("temp=25.5"), Some(25.5));
        assert_eq!(extract_numeric("garbage"), None);
    }
}
