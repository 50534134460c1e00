use crate::command::{AcknowledgeHandler, CommandHandler, STATUS_FAILURE, STATUS_SUCCESS, build_response};
use crate::{InboundCommand, Link, LinkEvent, LinkEvents, OutboundMessage, TransportError};
use pubsub_auth::{Credential, CredentialProvider};
use pubsub_telemetry::{
    record_command_received, record_command_response_sent, record_connect_attempt,
    record_connect_failure, record_disconnect, record_publish_latency_ms,
    record_reconnect_scheduled, record_reconnect_skipped,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 连接参数。
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// 日志中标识本连接
    pub client_id: String,
    /// 断线后是否由监督任务自动重连
    pub auto_reconnect: bool,
    /// 重连前的固定等待
    pub reconnect_delay: Duration,
    /// 连续重连次数上限，`None` 表示不限
    pub max_reconnect_attempts: Option<u32>,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    /// 关闭时等待在途命令响应的最长时间
    pub command_drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: None,
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            command_drain_timeout: Duration::from_secs(5),
        }
    }
}

/// 连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 终态：显式关闭、凭据错误或重连次数耗尽
    Closed,
}

/// 传给断线回调的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub reason: String,
    /// 是否已调度自动重连
    pub will_reconnect: bool,
}

type DisconnectHandler = Arc<dyn Fn(&DisconnectEvent) + Send + Sync>;
type EventReceiver = mpsc::UnboundedReceiver<(u64, LinkEvent)>;

struct ConnectionInner {
    config: ConnectionConfig,
    link: Arc<dyn Link>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    command_handler: Mutex<Arc<dyn CommandHandler>>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
    state: watch::Sender<ConnectionState>,
    /// 串行化 connect / publish / disconnect
    op_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    /// 当前会话序号，旧会话的事件一律忽略
    session: AtomicU64,
    /// 已上报过断线的会话序号
    reported_session: AtomicU64,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    events_rx: Mutex<Option<EventReceiver>>,
    workers: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

/// 到 broker 的单条出站会话。
///
/// 克隆得到的是同一连接的句柄；断线回调、重连监督任务与命令任务都通过句柄访问
/// 同一个连接对象。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(
        link: Arc<dyn Link>,
        credentials: Option<Arc<dyn CredentialProvider>>,
        config: ConnectionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = ConnectionInner {
            config,
            link,
            credentials,
            command_handler: Mutex::new(Arc::new(AcknowledgeHandler)),
            disconnect_handlers: Mutex::new(Vec::new()),
            state,
            op_lock: tokio::sync::Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            session: AtomicU64::new(0),
            reported_session: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            workers: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// 订阅状态变化。
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// 是否有重连序列在进行。
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    /// 注册断线回调；每次断线事件调用一次。
    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(&DisconnectEvent) + Send + Sync + 'static,
    {
        self.inner
            .disconnect_handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(handler));
    }

    /// 替换入站命令处理器（默认 `AcknowledgeHandler`）。
    pub fn on_command(&self, handler: Arc<dyn CommandHandler>) {
        *self
            .inner
            .command_handler
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = handler;
    }

    /// 建立连接：每次调用都生成新凭据；失败时不在内部重试。
    pub async fn connect(&self) -> Result<(), TransportError> {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.connect_locked().await
    }

    /// 发布一条消息；返回 `Ok` 表示消息已被客户端接收入队。
    pub async fn publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let _guard = self.inner.op_lock.lock().await;
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(TransportError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(TransportError::NotConnected);
            }
        }

        let timeout = self.inner.config.publish_timeout;
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.inner.link.send(message)).await {
            Ok(Ok(())) => {
                record_publish_latency_ms(started.elapsed().as_millis() as u64);
                debug!(
                    target: "pubsub.transport",
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    "message_sent"
                );
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Timeout {
                operation: "publish",
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// 调度一次重连；已有重连在进行时不做任何事并返回 `false`。
    pub fn schedule_reconnect(&self) -> bool {
        self.inner.schedule_reconnect()
    }

    /// 关闭连接：停止重连，等待在途命令响应（有上限），关闭会话并进入终态。
    ///
    /// 任何退出路径都可调用，重复调用安全。
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.drain_workers().await;

        let _guard = inner.op_lock.lock().await;
        let timeout = inner.config.publish_timeout;
        let result = match tokio::time::timeout(timeout, inner.link.close()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                operation: "disconnect",
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        let previous = inner.state.send_replace(ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            info!(
                target: "pubsub.transport",
                client_id = %inner.config.client_id,
                link = inner.link.name(),
                "connection_closed"
            );
        }
        if let Err(err) = &result {
            warn!(
                target: "pubsub.transport",
                client_id = %inner.config.client_id,
                error = %err,
                "link_close_failed"
            );
        }
        result
    }
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 调用方须持有 `op_lock`。
    async fn connect_locked(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.current_state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(TransportError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }
        self.ensure_dispatcher();
        self.set_state(ConnectionState::Connecting);
        record_connect_attempt();

        let credential = match self.issue_credential() {
            Ok(credential) => credential,
            Err(err) => {
                record_connect_failure();
                self.set_state(ConnectionState::Disconnected);
                error!(
                    target: "pubsub.transport",
                    client_id = %self.config.client_id,
                    error = %err,
                    "credential_generation_failed"
                );
                return Err(err);
            }
        };

        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        let events = LinkEvents::new(session, self.events_tx.clone());
        let timeout = self.config.connect_timeout;
        let opened = match tokio::time::timeout(
            timeout,
            self.link.open(credential.as_ref(), events),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                operation: "connect",
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match opened {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!(
                    target: "pubsub.transport",
                    client_id = %self.config.client_id,
                    link = self.link.name(),
                    session,
                    "connection_established"
                );
                Ok(())
            }
            Err(err) => {
                record_connect_failure();
                self.set_state(ConnectionState::Disconnected);
                warn!(
                    target: "pubsub.transport",
                    client_id = %self.config.client_id,
                    link = self.link.name(),
                    error = %err,
                    "connect_failed"
                );
                Err(err)
            }
        }
    }

    fn issue_credential(&self) -> Result<Option<Credential>, TransportError> {
        match &self.credentials {
            Some(provider) => Ok(Some(provider.issue()?)),
            None => Ok(None),
        }
    }

    /// 首次连接时启动事件分发任务。
    fn ensure_dispatcher(self: &Arc<Self>) {
        let receiver = self
            .events_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(receiver) = receiver {
            let weak = Arc::downgrade(self);
            let shutdown = self.shutdown.clone();
            tokio::spawn(dispatch_events(weak, receiver, shutdown));
        }
    }

    fn handle_disconnected(self: &Arc<Self>, session: u64, reason: String) {
        if session != self.session.load(Ordering::SeqCst) {
            debug!(target: "pubsub.transport", session, "stale_disconnect_ignored");
            return;
        }
        if self.reported_session.swap(session, Ordering::SeqCst) == session {
            return;
        }
        if self.current_state() == ConnectionState::Closed || self.shutdown.is_cancelled() {
            return;
        }

        // 状态切换与调度重连之间不能有 await
        self.set_state(ConnectionState::Disconnected);
        record_disconnect();
        let will_reconnect = self.config.auto_reconnect;
        warn!(
            target: "pubsub.transport",
            client_id = %self.config.client_id,
            link = self.link.name(),
            reason = %reason,
            will_reconnect,
            "connection_lost"
        );
        if will_reconnect {
            self.schedule_reconnect();
        }

        let event = DisconnectEvent {
            reason,
            will_reconnect,
        };
        let handlers = self
            .disconnect_handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for handler in handlers {
            handler(&event);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        if !self.config.auto_reconnect || self.shutdown.is_cancelled() {
            return false;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            record_reconnect_skipped();
            debug!(
                target: "pubsub.transport",
                client_id = %self.config.client_id,
                "reconnect_already_in_flight"
            );
            return false;
        }
        record_reconnect_scheduled();
        info!(
            target: "pubsub.transport",
            client_id = %self.config.client_id,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "reconnect_scheduled"
        );
        tokio::spawn(supervise_reconnect(Arc::downgrade(self)));
        true
    }

    fn spawn_command(self: &Arc<Self>, command: InboundCommand) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        // 回收已结束的任务
        while workers.try_join_next().is_some() {}
        if self.shutdown.is_cancelled() {
            debug!(target: "pubsub.transport", command = %command.name, "command_dropped_on_shutdown");
            return;
        }
        let handler = self
            .command_handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let connection = Connection {
            inner: Arc::clone(self),
        };
        workers.spawn(respond_to_command(connection, handler, command));
    }

    async fn drain_workers(&self) {
        let mut workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        if workers.is_empty() {
            return;
        }
        let pending = workers.len();
        let drained = tokio::time::timeout(self.config.command_drain_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                target: "pubsub.transport",
                client_id = %self.config.client_id,
                pending,
                remaining = workers.len(),
                "command_drain_timed_out"
            );
            workers.abort_all();
        }
    }
}

async fn dispatch_events(
    weak: Weak<ConnectionInner>,
    mut receiver: EventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = receiver.recv() => next,
        };
        let Some((session, event)) = next else {
            break;
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            LinkEvent::Disconnected { reason } => inner.handle_disconnected(session, reason),
            LinkEvent::Command(command) => {
                record_command_received();
                debug!(
                    target: "pubsub.transport",
                    command = %command.name,
                    topic = %command.topic,
                    "command_received"
                );
                inner.spawn_command(command);
            }
        }
    }
}

/// 重连监督：固定延迟后重试，成功、耗尽、关闭或凭据错误时结束。
async fn supervise_reconnect(weak: Weak<ConnectionInner>) {
    let mut attempt: u32 = 0;
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let delay = inner.config.reconnect_delay;
        let shutdown = inner.shutdown.clone();
        drop(inner);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = weak.upgrade() else {
            return;
        };
        attempt += 1;
        let result = {
            let _guard = inner.op_lock.lock().await;
            if inner.current_state() != ConnectionState::Disconnected {
                None
            } else {
                Some(inner.connect_locked().await)
            }
        };

        match result {
            None => break,
            Some(Ok(())) => {
                info!(
                    target: "pubsub.transport",
                    client_id = %inner.config.client_id,
                    attempt,
                    "reconnected"
                );
                break;
            }
            Some(Err(TransportError::Credential(err))) => {
                error!(
                    target: "pubsub.transport",
                    client_id = %inner.config.client_id,
                    error = %err,
                    "reconnect_aborted"
                );
                inner.set_state(ConnectionState::Closed);
                break;
            }
            Some(Err(_)) if shutdown.is_cancelled() => break,
            Some(Err(err)) => {
                if let Some(max) = inner.config.max_reconnect_attempts
                    && attempt >= max
                {
                    error!(
                        target: "pubsub.transport",
                        client_id = %inner.config.client_id,
                        attempt,
                        error = %err,
                        "reconnect_exhausted"
                    );
                    inner.set_state(ConnectionState::Closed);
                    break;
                }
                warn!(
                    target: "pubsub.transport",
                    client_id = %inner.config.client_id,
                    attempt,
                    error = %err,
                    "reconnect_attempt_failed"
                );
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.reconnecting.store(false, Ordering::SeqCst);
        // 标志复位前到达的断线触发会被跳过，这里补一次
        if inner.current_state() == ConnectionState::Disconnected && !inner.shutdown.is_cancelled() {
            inner.schedule_reconnect();
        }
    }
}

async fn respond_to_command(
    connection: Connection,
    handler: Arc<dyn CommandHandler>,
    command: InboundCommand,
) {
    let (status, body) = match handler.handle(&command).await {
        Ok(body) => (STATUS_SUCCESS, body),
        Err(err) => {
            warn!(
                target: "pubsub.transport",
                command = %command.name,
                error = %err,
                "command_handler_failed"
            );
            (
                STATUS_FAILURE,
                serde_json::json!({ "error": err.to_string() }),
            )
        }
    };
    let response = build_response(&command, status, &body);
    match connection.publish(&response).await {
        Ok(()) => {
            record_command_response_sent();
            debug!(
                target: "pubsub.transport",
                command = %command.name,
                topic = %response.topic,
                status,
                "command_response_sent"
            );
        }
        Err(err) => {
            warn!(
                target: "pubsub.transport",
                command = %command.name,
                error = %err,
                "command_response_failed"
            );
        }
    }
}
