//! # 数据源能力模块
//!
//! 发布循环每个节拍向数据源取一次读数：
//!
//! - **FixtureSource**：逐行读取 fixture 文件，读到末尾后回绕到第一行
//! - **TcpLineSource**：连接远端设备，按需发送请求命令并读取一行响应
//!
//! 数据源只负责产出原始文本（`domain::Reading`），数值解析与异常恢复由发布循环处理。

mod fixture;
mod tcp_line;

use async_trait::async_trait;
use domain::Reading;

pub use fixture::FixtureSource;
pub use tcp_line::{TcpLineConfig, TcpLineSource, extract_numeric};

/// 数据源错误。
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source is empty: {0}")]
    Empty(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

/// 数据源抽象。
#[async_trait]
pub trait DataSource: Send {
    /// 取下一条读数。
    async fn next_reading(&mut self) -> Result<Reading, SourceError>;
}

pub(crate) fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
