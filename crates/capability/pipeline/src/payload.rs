use domain::{ParseError, Reading};
use pubsub_telemetry::record_reading_malformed;
use tracing::warn;

/// 负载计算策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadPolicy {
    /// 电能表：发布所有有效读数的累计值
    #[default]
    Accumulate,
    /// 即时值：发布最近一次有效读数
    Gauge,
}

/// 按策略把读数折算为待发布的数值。
///
/// 读数无法解析时不中断：累计值保持不变，即时值沿用上一次有效读数（没有则为 0）。
#[derive(Debug, Clone, Default)]
pub struct PayloadComputer {
    policy: PayloadPolicy,
    total: f64,
    last_good: Option<f64>,
}

impl PayloadComputer {
    pub fn new(policy: PayloadPolicy) -> Self {
        Self {
            policy,
            total: 0.0,
            last_good: None,
        }
    }

    pub fn policy(&self) -> PayloadPolicy {
        self.policy
    }

    /// 纳入一条读数并返回当前应发布的值。
    pub fn apply(&mut self, reading: &Reading) -> f64 {
        match reading.parse_f64() {
            Ok(value) => self.accept(value),
            Err(err) => self.recover(reading, err),
        }
    }

    fn accept(&mut self, value: f64) -> f64 {
        self.last_good = Some(value);
        match self.policy {
            PayloadPolicy::Accumulate => {
                self.total += value;
                self.total
            }
            PayloadPolicy::Gauge => value,
        }
    }

    fn recover(&mut self, reading: &Reading, err: ParseError) -> f64 {
        record_reading_malformed();
        let retained = self.current();
        warn!(
            target: "pubsub.pipeline",
            source = %reading.name,
            index = reading.index,
            error = %err,
            retained,
            "reading_malformed"
        );
        retained
    }

    /// 不纳入新读数时的当前值。
    pub fn current(&self) -> f64 {
        match self.policy {
            PayloadPolicy::Accumulate => self.total,
            PayloadPolicy::Gauge => self.last_good.unwrap_or(0.0),
        }
    }
}
