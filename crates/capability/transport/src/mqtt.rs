//! MQTT 3.1.1 链路
//!
//! 3.1.1 没有属性，内容类型与自定义属性被忽略；只发布遥测，不处理命令。

use crate::{DeliveryQos, Link, LinkEvents, OutboundMessage, TransportError};
use async_trait::async_trait;
use pubsub_auth::Credential;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// IoT Hub 风格 broker 使用的 API 版本。
pub const IOT_HUB_API_VERSION: &str = "2021-04-12";

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// 由 broker 主机与设备标识推导用户名。
pub fn iot_hub_username(host: &str, client_id: &str) -> String {
    format!("{}/{}/?api-version={}", host, client_id, IOT_HUB_API_VERSION)
}

/// MQTT 链路配置（3.1.1 与 5 共用）。
#[derive(Debug, Clone)]
pub struct MqttLinkConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub tls: bool,
    /// 覆盖推导出的用户名
    pub username: Option<String>,
    /// 静态口令；有凭据时被凭据 token 替代
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// 客户端请求队列容量
    pub channel_capacity: usize,
}

impl MqttLinkConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            tls: true,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            channel_capacity: 10,
        }
    }

    /// 计算连接用户名与口令。
    pub(crate) fn login(&self, credential: Option<&Credential>) -> Option<(String, String)> {
        let password = match credential {
            Some(credential) => Some(credential.token.clone()),
            None => self.password.clone(),
        }?;
        let username = self
            .username
            .clone()
            .unwrap_or_else(|| iot_hub_username(&self.host, &self.client_id));
        Some((username, password))
    }
}

pub(crate) fn qos(qos: DeliveryQos) -> QoS {
    match qos {
        DeliveryQos::AtMostOnce => QoS::AtMostOnce,
        DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// 一次会话的后台资源，关闭时先置位 `closing`，避免上报断线。
pub(crate) struct Session<C> {
    pub(crate) client: C,
    pub(crate) closing: Arc<AtomicBool>,
    pub(crate) driver: JoinHandle<()>,
}

impl<C> Session<C> {
    pub(crate) async fn shutdown(mut self) {
        let _ = tokio::time::timeout(CLOSE_GRACE, &mut self.driver).await;
        self.driver.abort();
    }
}

/// MQTT 3.1.1 链路。
pub struct MqttLink {
    config: MqttLinkConfig,
    session: Mutex<Option<Session<AsyncClient>>>,
}

impl MqttLink {
    pub fn new(config: MqttLinkConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    fn options(&self, credential: Option<&Credential>) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(self.config.clean_session);
        if let Some((username, password)) = self.config.login(credential) {
            options.set_credentials(username, password);
        }
        if self.config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    async fn close_session(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.closing.store(true, Ordering::SeqCst);
            let _ = session.client.disconnect().await;
            session.shutdown().await;
        }
    }
}

/// 等待 ConnAck；拒绝与网络错误映射为连接错误。
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(TransportError::Connect {
                    reason: "connection refused".to_string(),
                    properties: vec![("reason_code".to_string(), format!("{:?}", code))],
                });
            }
            Err(err) => return Err(TransportError::connect(err.to_string())),
        }
    }
}

async fn drive(mut eventloop: EventLoop, events: LinkEvents, closing: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!(target: "pubsub.transport", pkid = ack.pkid, "puback_received");
            }
            Ok(_) => {}
            Err(err) => {
                if !closing.load(Ordering::SeqCst) {
                    events.disconnected(err.to_string());
                }
                return;
            }
        }
    }
}

#[async_trait]
impl Link for MqttLink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn open(
        &self,
        credential: Option<&Credential>,
        events: LinkEvents,
    ) -> Result<(), TransportError> {
        self.close_session().await;

        let options = self.options(credential);
        let (client, mut eventloop) = AsyncClient::new(options, self.config.channel_capacity);
        await_connack(&mut eventloop).await?;

        info!(
            target: "pubsub.transport",
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            session = events.session(),
            "mqtt_connack_received"
        );
        let closing = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive(eventloop, events, closing.clone()));
        *self.session.lock().await = Some(Session {
            client,
            closing,
            driver,
        });
        Ok(())
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let client = match self.session.lock().await.as_ref() {
            Some(session) => session.client.clone(),
            None => return Err(TransportError::NotConnected),
        };
        client
            .publish(
                message.topic.clone(),
                qos(message.qos),
                false,
                message.payload.clone(),
            )
            .await
            .map_err(|err| TransportError::publish(err.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_session().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_follows_iot_hub_convention() {
        assert_eq!(
            iot_hub_username("hub.example", "dev1"),
            "hub.example/dev1/?api-version=2021-04-12"
        );
    }

    #[test]
    fn login_falls_back_to_static_password() {
        let mut config = MqttLinkConfig::new("hub.example", 8883, "dev1");
        config.password = Some("static".to_string());
        assert_eq!(
            config.login(None),
            Some((
                "hub.example/dev1/?api-version=2021-04-12".to_string(),
                "static".to_string()
            ))
        );

        config.password = None;
        config.username = Some("custom".to_string());
        assert_eq!(config.login(None), None);
    }
}
