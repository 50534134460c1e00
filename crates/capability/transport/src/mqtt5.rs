//! MQTT 5 链路
//!
//! 连接成功后订阅 `<ns>/methods/+`，入站发布转为命令事件；遥测发布携带
//! content-type 与 user properties。MQTT 5 凭据方案通过增强认证字段携带签名。

use crate::command::{command_name, methods_filter, responses_topic};
use crate::mqtt::{MqttLinkConfig, Session};
use crate::{DeliveryQos, InboundCommand, Link, LinkEvents, OutboundMessage, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use pubsub_auth::{Credential, SAS_AUTH_METHOD, SasScheme};
use rumqttc::Transport;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties, SubscribeReasonCode};
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// MQTT 5 链路配置。
#[derive(Debug, Clone)]
pub struct Mqtt5LinkConfig {
    pub mqtt: MqttLinkConfig,
    /// 命令命名空间；`None` 表示不订阅命令
    pub command_namespace: Option<String>,
}

/// MQTT 5 链路。
pub struct Mqtt5Link {
    config: Mqtt5LinkConfig,
    session: Mutex<Option<Session<AsyncClient>>>,
}

impl Mqtt5Link {
    pub fn new(config: Mqtt5LinkConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    fn options(&self, credential: Option<&Credential>) -> MqttOptions {
        let mqtt = &self.config.mqtt;
        let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
        options.set_keep_alive(mqtt.keep_alive);
        options.set_clean_start(mqtt.clean_session);
        if mqtt.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        match credential {
            Some(credential) if credential.scheme == SasScheme::Mqtt5 => {
                let username = mqtt
                    .username
                    .clone()
                    .unwrap_or_else(|| crate::iot_hub_username(&mqtt.host, &mqtt.client_id));
                options.set_credentials(username, "");
                options.set_authentication_method(Some(SAS_AUTH_METHOD.to_string()));
                options.set_authentication_data(Some(Bytes::from(credential.signature_bytes.clone())));
                options.set_user_properties(credential.side_properties());
            }
            _ => {
                if let Some((username, password)) = mqtt.login(credential) {
                    options.set_credentials(username, password);
                }
            }
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

fn qos(qos: DeliveryQos) -> QoS {
    match qos {
        DeliveryQos::AtMostOnce => QoS::AtMostOnce,
        DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn refused(reason: impl Into<String>, code: impl std::fmt::Debug) -> TransportError {
    TransportError::Connect {
        reason: reason.into(),
        properties: vec![("reason_code".to_string(), format!("{:?}", code))],
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(refused("connection refused", code));
            }
            Err(err) => return Err(TransportError::connect(err.to_string())),
        }
    }
}

/// 订阅命令 topic 并等待 SubAck；任一过滤器被拒绝即视为协议错误。
async fn subscribe_commands(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    filter: &str,
) -> Result<(), TransportError> {
    client
        .subscribe(filter, QoS::AtLeastOnce)
        .await
        .map_err(|err| TransportError::Protocol(format!("subscribe {}: {}", filter, err)))?;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .find(|code| !matches!(code, SubscribeReasonCode::Success(_)));
                return match rejected {
                    Some(code) => Err(TransportError::Protocol(format!(
                        "subscribe {} rejected: {:?}",
                        filter, code
                    ))),
                    None => Ok(()),
                };
            }
            Ok(_) => {}
            Err(err) => {
                return Err(TransportError::Protocol(format!(
                    "subscribe {}: {}",
                    filter, err
                )));
            }
        }
    }
}

fn to_command(
    topic: String,
    payload: Bytes,
    properties: Option<PublishProperties>,
    namespace: &str,
) -> InboundCommand {
    let properties = properties.unwrap_or_default();
    InboundCommand {
        name: command_name(&topic),
        topic,
        payload: payload.to_vec(),
        correlation_data: properties.correlation_data.map(|data| data.to_vec()),
        response_topic: properties
            .response_topic
            .unwrap_or_else(|| responses_topic(namespace)),
        properties: properties.user_properties,
    }
}

async fn drive(
    mut eventloop: EventLoop,
    events: LinkEvents,
    closing: Arc<AtomicBool>,
    namespace: Option<String>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(namespace) = namespace.as_deref() else {
                    continue;
                };
                let topic = String::from_utf8_lossy(&publish.topic).to_string();
                if !topic.contains("/methods/") {
                    debug!(target: "pubsub.transport", topic = %topic, "unexpected_publish_ignored");
                    continue;
                }
                events.command(to_command(
                    topic,
                    publish.payload,
                    publish.properties,
                    namespace,
                ));
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
impl Link for Mqtt5Link {
    fn name(&self) -> &'static str {
        "mqtt5"
    }

    fn supports_commands(&self) -> bool {
        self.config.command_namespace.is_some()
    }

    async fn open(
        &self,
        credential: Option<&Credential>,
        events: LinkEvents,
    ) -> Result<(), TransportError> {
        self.close_session().await;

        let mqtt = &self.config.mqtt;
        let options = self.options(credential);
        let (client, mut eventloop) = AsyncClient::new(options, mqtt.channel_capacity);
        await_connack(&mut eventloop).await?;

        if let Some(namespace) = self.config.command_namespace.as_deref() {
            let filter = methods_filter(namespace);
            if let Err(err) = subscribe_commands(&client, &mut eventloop, &filter).await {
                warn!(
                    target: "pubsub.transport",
                    client_id = %mqtt.client_id,
                    error = %err,
                    "command_subscribe_failed"
                );
                let _ = client.disconnect().await;
                return Err(err);
            }
            info!(target: "pubsub.transport", filter = %filter, "command_subscribed");
        }

        info!(
            target: "pubsub.transport",
            host = %mqtt.host,
            port = mqtt.port,
            client_id = %mqtt.client_id,
            session = events.session(),
            "mqtt5_connack_received"
        );
        let closing = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive(
            eventloop,
            events,
            closing.clone(),
            self.config.command_namespace.clone(),
        ));
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
        let properties = PublishProperties {
            content_type: message.content_type.clone(),
            correlation_data: message.correlation_data.clone().map(Bytes::from),
            user_properties: message.properties.clone(),
            ..Default::default()
        };
        client
            .publish_with_properties(
                message.topic.clone(),
                qos(message.qos),
                false,
                Bytes::from(message.payload.clone()),
                properties,
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
    fn inbound_publish_becomes_command() {
        let properties = PublishProperties {
            correlation_data: Some(Bytes::from_static(b"abc123")),
            ..Default::default()
        };
        let command = to_command(
            "ns/methods/reboot".to_string(),
            Bytes::from_static(b"{\"delay\":1}"),
            Some(properties),
            "ns",
        );
        assert_eq!(command.name, "reboot");
        assert_eq!(command.response_topic, "ns/responses");
        assert_eq!(command.correlation_data.as_deref(), Some(&b"abc123"[..]));
        assert_eq!(command.payload, b"{\"delay\":1}");
    }

    #[test]
    fn explicit_response_topic_wins() {
        let properties = PublishProperties {
            response_topic: Some("custom/replies".to_string()),
            ..Default::default()
        };
        let command = to_command(
            "ns/methods/ping".to_string(),
            Bytes::new(),
            Some(properties),
            "ns",
        );
        assert_eq!(command.response_topic, "custom/replies");
        assert!(command.correlation_data.is_none());
    }
}
