//! Kafka 链路（SASL PLAIN over TLS，Event Hubs 兼容端点）
//!
//! 没有会话级断线通知，也不处理命令；发布失败交给发布循环处理。

use crate::{Link, LinkEvents, OutboundMessage, TransportError};
use async_trait::async_trait;
use pubsub_auth::Credential;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Event Hubs 约定的 SASL 用户名。
pub const CONNECTION_STRING_USERNAME: &str = "$ConnectionString";

/// Kafka 链路配置。
#[derive(Debug, Clone)]
pub struct KafkaLinkConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// 完整连接串；缺省时由凭据 token 拼出
    pub connection_string: Option<String>,
    pub message_timeout: Duration,
    pub flush_timeout: Duration,
}

impl KafkaLinkConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            connection_string: None,
            message_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(10),
        }
    }

    fn password(&self, credential: Option<&Credential>) -> Result<String, TransportError> {
        if let Some(connection_string) = &self.connection_string {
            return Ok(connection_string.clone());
        }
        match credential {
            Some(credential) => Ok(format!(
                "Endpoint=sb://{}/;SharedAccessSignature={}",
                self.host, credential.token
            )),
            None => Err(TransportError::connect(
                "kafka link requires a connection string or credential",
            )),
        }
    }
}

/// Kafka 生产者链路。
pub struct KafkaLink {
    config: KafkaLinkConfig,
    producer: Mutex<Option<FutureProducer>>,
}

impl KafkaLink {
    pub fn new(config: KafkaLinkConfig) -> Self {
        Self {
            config,
            producer: Mutex::new(None),
        }
    }

    /// 刷出并释放生产者。`flush` 会阻塞到队列清空或超时，放到阻塞线程池执行。
    async fn retire(&self, producer: FutureProducer) {
        let timeout = self.config.flush_timeout;
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(target: "pubsub.transport", error = %err, "kafka_flush_failed");
            }
            Err(err) => {
                warn!(target: "pubsub.transport", error = %err, "kafka_flush_task_failed");
            }
        }
    }
}

#[async_trait]
impl Link for KafkaLink {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn open(
        &self,
        credential: Option<&Credential>,
        events: LinkEvents,
    ) -> Result<(), TransportError> {
        let password = self.config.password(credential)?;
        let producer: FutureProducer = ClientConfig::new()
            .set(
                "bootstrap.servers",
                format!("{}:{}", self.config.host, self.config.port),
            )
            .set("client.id", &self.config.client_id)
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", CONNECTION_STRING_USERNAME)
            .set("sasl.password", password)
            .set(
                "message.timeout.ms",
                self.config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|err| TransportError::connect(err.to_string()))?;

        let previous = self.producer.lock().await.replace(producer);
        if let Some(previous) = previous {
            self.retire(previous).await;
        }
        info!(
            target: "pubsub.transport",
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            session = events.session(),
            "kafka_producer_created"
        );
        Ok(())
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let producer = match self.producer.lock().await.as_ref() {
            Some(producer) => producer.clone(),
            None => return Err(TransportError::NotConnected),
        };

        let mut headers = OwnedHeaders::new();
        if let Some(content_type) = &message.content_type {
            headers = headers.insert(Header {
                key: "Content-Type",
                value: Some(content_type.as_str()),
            });
        }
        for (key, value) in &message.properties {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::<(), [u8]>::to(&message.topic)
            .payload(message.payload.as_slice())
            .headers(headers);
        producer
            .send(record, Timeout::After(self.config.message_timeout))
            .await
            .map(|_| ())
            .map_err(|(err, _)| TransportError::publish(err.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let producer = self.producer.lock().await.take();
        if let Some(producer) = producer {
            self.retire(producer).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[test]
    fn connection_string_takes_precedence() {
        let mut config = KafkaLinkConfig::new("ns.servicebus.windows.net", 9093, "producer");
        config.connection_string = Some("Endpoint=sb://ns/;SharedAccessKeyName=k".to_string());
        assert_eq!(
            config.password(None).expect("password"),
            "Endpoint=sb://ns/;SharedAccessKeyName=k"
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_does_not_block_the_runtime_while_flushing() {
        let mut config = KafkaLinkConfig::new("127.0.0.1", 1, "producer");
        config.connection_string = Some("Endpoint=sb://127.0.0.1/;SharedAccessKeyName=k".to_string());
        config.message_timeout = Duration::from_secs(5);
        config.flush_timeout = Duration::from_millis(500);
        let link = Arc::new(KafkaLink::new(config));
        let (tx, _rx) = mpsc::unbounded_channel();
        link.open(None, LinkEvents::new(1, tx)).await.expect("open");

        // broker 不可达，消息留在队列里，close 时的 flush 要等到超时
        let sender = link.clone();
        tokio::spawn(async move {
            let message =
                OutboundMessage::telemetry("telemetry", "{}".to_string(), "application/json");
            let _ = sender.send(&message).await;
        });
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = ticks.load(Ordering::SeqCst);
        let started = std::time::Instant::now();
        link.close().await.expect("close");
        let elapsed = started.elapsed();

        if elapsed >= Duration::from_millis(200) {
            assert!(ticks.load(Ordering::SeqCst) > before);
        }
        assert!(matches!(
            link.send(&OutboundMessage::telemetry("t", "{}".to_string(), "application/json"))
                .await,
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn missing_password_source_is_connect_error() {
        let config = KafkaLinkConfig::new("ns.servicebus.windows.net", 9093, "producer");
        assert!(matches!(
            config.password(None),
            Err(TransportError::Connect { .. })
        ));
    }
}
