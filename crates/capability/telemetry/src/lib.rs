//! 日志初始化与发布链路计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub envelopes_published: u64,
    pub publish_failures: u64,
    pub readings_malformed: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub reconnects_scheduled: u64,
    pub reconnects_skipped: u64,
    pub disconnects: u64,
    pub commands_received: u64,
    pub command_responses_sent: u64,
    pub publish_latency_ms_total: u64,
    pub publish_latency_ms_count: u64,
}

/// 发布链路计数指标。
pub struct PublisherMetrics {
    envelopes_published: AtomicU64,
    publish_failures: AtomicU64,
    readings_malformed: AtomicU64,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    reconnects_scheduled: AtomicU64,
    reconnects_skipped: AtomicU64,
    disconnects: AtomicU64,
    commands_received: AtomicU64,
    command_responses_sent: AtomicU64,
    publish_latency_ms_total: AtomicU64,
    publish_latency_ms_count: AtomicU64,
}

impl PublisherMetrics {
    pub fn new() -> Self {
        Self {
            envelopes_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            readings_malformed: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            reconnects_skipped: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            command_responses_sent: AtomicU64::new(0),
            publish_latency_ms_total: AtomicU64::new(0),
            publish_latency_ms_count: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            envelopes_published: self.envelopes_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            readings_malformed: self.readings_malformed.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            reconnects_skipped: self.reconnects_skipped.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            command_responses_sent: self.command_responses_sent.load(Ordering::Relaxed),
            publish_latency_ms_total: self.publish_latency_ms_total.load(Ordering::Relaxed),
            publish_latency_ms_count: self.publish_latency_ms_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for PublisherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<PublisherMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static PublisherMetrics {
    METRICS.get_or_init(PublisherMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录信封发布成功次数。
pub fn record_envelope_published() {
    metrics().envelopes_published.fetch_add(1, Ordering::Relaxed);
}

/// 记录发布失败次数。
pub fn record_publish_failure() {
    metrics().publish_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录无法解析的读数。
pub fn record_reading_malformed() {
    metrics().readings_malformed.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接尝试次数（含重连）。
pub fn record_connect_attempt() {
    metrics().connect_attempts.fetch_add(1, Ordering::Relaxed);
}

pub fn record_connect_failure() {
    metrics().connect_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录已调度的重连。
pub fn record_reconnect_scheduled() {
    metrics().reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
}

/// 记录因已有重连在途而忽略的触发。
pub fn record_reconnect_skipped() {
    metrics().reconnects_skipped.fetch_add(1, Ordering::Relaxed);
}

pub fn record_disconnect() {
    metrics().disconnects.fetch_add(1, Ordering::Relaxed);
}

pub fn record_command_received() {
    metrics().commands_received.fetch_add(1, Ordering::Relaxed);
}

pub fn record_command_response_sent() {
    metrics()
        .command_responses_sent
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录单次发布耗时（毫秒）。
pub fn record_publish_latency_ms(latency_ms: u64) {
    let metrics = metrics();
    metrics
        .publish_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .publish_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}
