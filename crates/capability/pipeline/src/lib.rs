//! # 发布循环
//!
//! 以固定节拍驱动「取数 → 折算 → 编码信封 → 发布」：
//!
//! ```text
//! DataSource ──► PayloadComputer ──► envelope::encode ──► Connection::publish
//!      ▲                                                        │
//!      └──────────────── sleep(interval) / 取消 / 断线 ◄─────────┘
//! ```
//!
//! 退出条件：达到迭代上限、收到取消信号、非自动重连连接断开、连接进入终态，
//! 或非自动重连连接上的发布失败。任何退出路径都会关闭连接。
//!
//! 自动重连连接的首次连接失败与会话中断同样处理：交给重连监督任务，循环照常
//! 运行（期间的发布计为丢弃）。

mod payload;

use chrono::Utc;
use domain::PayloadValue;
use envelope::{CONTENT_TYPE_JSON, EncodeError, VariantEncoding};
use pubsub_source::DataSource;
use pubsub_telemetry::{record_envelope_published, record_publish_failure};
use pubsub_transport::{Connection, ConnectionState, OutboundMessage, TransportError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use payload::{PayloadComputer, PayloadPolicy};

/// 发布循环错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// 发布循环参数。
#[derive(Debug, Clone)]
pub struct PublishLoopConfig {
    pub publisher_id: String,
    pub writer_id: String,
    /// Payload 中的字段名
    pub payload_field: String,
    pub topic: String,
    pub interval: Duration,
    /// 迭代上限；`None` 表示一直运行
    pub max_iterations: Option<u64>,
    pub policy: PayloadPolicy,
    pub encoding: VariantEncoding,
}

impl Default for PublishLoopConfig {
    fn default() -> Self {
        Self {
            publisher_id: "publisher".to_string(),
            writer_id: "1".to_string(),
            payload_field: "Energy".to_string(),
            topic: "telemetry".to_string(),
            interval: Duration::from_secs(1),
            max_iterations: None,
            policy: PayloadPolicy::Accumulate,
            encoding: VariantEncoding::Reversible,
        }
    }
}

/// 循环结束原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// 达到迭代上限
    Completed,
    Cancelled,
    /// 非自动重连连接断开
    Disconnected,
    /// 连接进入终态（重连耗尽或凭据失效）
    Closed,
}

/// 运行汇总。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub iterations: u64,
    pub published: u64,
    /// 被丢弃的发布（自动重连连接在断线窗口内的发布）
    pub dropped: u64,
    pub exit: LoopExit,
}

/// 发布循环。
pub struct PublishLoop<S> {
    config: PublishLoopConfig,
    source: S,
    connection: Connection,
    payload: PayloadComputer,
    /// 信封 MessageId，从 0 开始单调递增
    counter: u64,
}

impl<S: DataSource> PublishLoop<S> {
    pub fn new(config: PublishLoopConfig, source: S, connection: Connection) -> Self {
        let payload = PayloadComputer::new(config.policy);
        Self {
            config,
            source,
            connection,
            payload,
            counter: 0,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// 建立连接并运行，直到满足退出条件；无论结果如何都会关闭连接。
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<LoopReport, PipelineError> {
        let auto_reconnect = self.connection.config().auto_reconnect;
        let result = match self.connection.connect().await {
            Ok(()) => self.publish_until_exit(&shutdown).await,
            Err(err) if auto_reconnect && retry_initial_connect(&err) => {
                warn!(
                    target: "pubsub.pipeline",
                    client_id = %self.connection.config().client_id,
                    error = %err,
                    "initial_connect_failed_retrying"
                );
                self.connection.schedule_reconnect();
                self.publish_until_exit(&shutdown).await
            }
            Err(err) => {
                error!(
                    target: "pubsub.pipeline",
                    client_id = %self.connection.config().client_id,
                    error = %err,
                    "initial_connect_failed"
                );
                Err(err.into())
            }
        };

        if let Err(err) = self.connection.disconnect().await {
            warn!(target: "pubsub.pipeline", error = %err, "teardown_failed");
        }
        match &result {
            Ok(report) => info!(
                target: "pubsub.pipeline",
                iterations = report.iterations,
                published = report.published,
                dropped = report.dropped,
                exit = ?report.exit,
                "publish_loop_stopped"
            ),
            Err(err) => error!(target: "pubsub.pipeline", error = %err, "publish_loop_failed"),
        }
        result
    }

    async fn publish_until_exit(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<LoopReport, PipelineError> {
        let auto_reconnect = self.connection.config().auto_reconnect;
        let mut state = self.connection.subscribe_state();
        let mut report = LoopReport {
            iterations: 0,
            published: 0,
            dropped: 0,
            exit: LoopExit::Completed,
        };
        info!(
            target: "pubsub.pipeline",
            topic = %self.config.topic,
            interval_ms = self.config.interval.as_millis() as u64,
            policy = ?self.config.policy,
            auto_reconnect,
            "publish_loop_started"
        );

        loop {
            if let Some(max) = self.config.max_iterations
                && report.iterations >= max
            {
                report.exit = LoopExit::Completed;
                return Ok(report);
            }
            if shutdown.is_cancelled() {
                report.exit = LoopExit::Cancelled;
                return Ok(report);
            }
            if let Some(exit) = stop_reason(self.connection.state(), auto_reconnect) {
                report.exit = exit;
                return Ok(report);
            }

            report.iterations += 1;
            match self.publish_once().await {
                Ok(true) => report.published += 1,
                Ok(false) => report.dropped += 1,
                Err(err) => return Err(err),
            }
            if self.config.max_iterations == Some(report.iterations) {
                report.exit = LoopExit::Completed;
                return Ok(report);
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = wait_for_stop(&mut state, auto_reconnect) => {}
            }
        }
    }

    /// 单次迭代：返回是否发布成功；无法恢复的错误向上传播。
    async fn publish_once(&mut self) -> Result<bool, PipelineError> {
        let reading = match self.source.next_reading().await {
            Ok(reading) => reading,
            Err(err) => {
                // 远端数据源暂时不可用，跳过本次节拍
                warn!(target: "pubsub.pipeline", error = %err, "source_read_failed");
                return Ok(false);
            }
        };
        let value = self.payload.apply(&reading);

        let message_id = self.counter;
        self.counter += 1;
        let text = envelope::encode(
            message_id,
            &self.config.publisher_id,
            &self.config.writer_id,
            Utc::now(),
            vec![(self.config.payload_field.clone(), PayloadValue::F64(value))],
            self.config.encoding,
        )?;
        let message = OutboundMessage::telemetry(self.config.topic.clone(), text, CONTENT_TYPE_JSON);

        match self.connection.publish(&message).await {
            Ok(()) => {
                record_envelope_published();
                debug!(
                    target: "pubsub.pipeline",
                    message_id,
                    topic = %message.topic,
                    value,
                    "envelope_published"
                );
                Ok(true)
            }
            Err(err) => {
                record_publish_failure();
                if self.connection.config().auto_reconnect && recoverable(&err) {
                    warn!(
                        target: "pubsub.pipeline",
                        message_id,
                        error = %err,
                        "envelope_dropped"
                    );
                    Ok(false)
                } else {
                    error!(
                        target: "pubsub.pipeline",
                        message_id,
                        error = %err,
                        "publish_failed"
                    );
                    Err(err.into())
                }
            }
        }
    }
}

/// 自动重连连接上可由连接层自行恢复的发布错误。
fn recoverable(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::NotConnected | TransportError::Publish { .. } | TransportError::Timeout { .. }
    )
}

/// 首次连接失败中可交给重连监督任务的错误；凭据错误重试也无法恢复。
fn retry_initial_connect(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Connect { .. } | TransportError::Timeout { .. }
    )
}

fn stop_reason(state: ConnectionState, auto_reconnect: bool) -> Option<LoopExit> {
    match state {
        ConnectionState::Closed => Some(LoopExit::Closed),
        ConnectionState::Disconnected | ConnectionState::Connecting if !auto_reconnect => {
            Some(LoopExit::Disconnected)
        }
        _ => None,
    }
}

/// 等待连接进入需要结束循环的状态。
async fn wait_for_stop(state: &mut watch::Receiver<ConnectionState>, auto_reconnect: bool) {
    let stopped = state
        .wait_for(|state| stop_reason(*state, auto_reconnect).is_some())
        .await
        .is_ok();
    if !stopped {
        std::future::pending::<()>().await;
    }
}
