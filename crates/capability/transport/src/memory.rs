use crate::{InboundCommand, Link, LinkEvents, OutboundMessage, TransportError};
use async_trait::async_trait;
use pubsub_auth::Credential;
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
struct MemoryState {
    open_attempts: usize,
    opens: Vec<Instant>,
    closes: usize,
    tokens: Vec<Option<String>>,
    sent: Vec<OutboundMessage>,
    failing_opens: usize,
    reject_sends: bool,
    events: Option<LinkEvents>,
    /// 每次成功 open 拿到的事件发送端，按 open 顺序保留
    sessions: Vec<LinkEvents>,
}

/// 内存链路：记录每次 open / send / close，可注入断线与命令。
///
/// 用于连接状态机与发布循环的测试。
#[derive(Default)]
pub struct MemoryLink {
    commands: bool,
    state: Mutex<MemoryState>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明支持命令通道。
    pub fn with_commands() -> Self {
        Self {
            commands: true,
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 之后的 `count` 次 open 返回连接拒绝。
    pub fn fail_next_opens(&self, count: usize) {
        self.state().failing_opens = count;
    }

    pub fn reject_sends(&self, reject: bool) {
        self.state().reject_sends = reject;
    }

    /// 模拟当前会话断线；没有活动会话时返回 `false`。
    pub fn inject_disconnect(&self, reason: &str) -> bool {
        match self.state().events.take() {
            Some(events) => {
                events.disconnected(reason);
                true
            }
            None => false,
        }
    }

    /// 通过第 `nth` 次成功 open 的事件发送端再上报一次断线（从 0 开始）。
    ///
    /// 模拟协议驱动任务重复上报，或旧会话在新会话建立后才迟到的断线通知。
    pub fn replay_disconnect(&self, nth: usize, reason: &str) -> bool {
        match self.state().sessions.get(nth) {
            Some(events) => {
                events.disconnected(reason);
                true
            }
            None => false,
        }
    }

    /// 模拟收到一条命令。
    pub fn inject_command(&self, command: InboundCommand) -> bool {
        match self.state().events.as_ref() {
            Some(events) => {
                events.command(command);
                true
            }
            None => false,
        }
    }

    pub fn open_attempts(&self) -> usize {
        self.state().open_attempts
    }

    /// 成功 open 的次数。
    pub fn opens(&self) -> usize {
        self.state().opens.len()
    }

    /// 每次成功 open 的时刻。
    pub fn open_instants(&self) -> Vec<Instant> {
        self.state().opens.clone()
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    /// 每次 open 携带的凭据 token。
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.state().tokens.clone()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state().sent.clone()
    }

    pub fn sent_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.state()
            .sent
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn is_open(&self) -> bool {
        self.state().events.is_some()
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_commands(&self) -> bool {
        self.commands
    }

    async fn open(
        &self,
        credential: Option<&Credential>,
        events: LinkEvents,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.open_attempts += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::Connect {
                reason: "connection refused".to_string(),
                properties: vec![("reason_code".to_string(), "NotAuthorized".to_string())],
            });
        }
        state.tokens.push(credential.map(|credential| credential.token.clone()));
        state.opens.push(Instant::now());
        state.sessions.push(events.clone());
        state.events = Some(events);
        Ok(())
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        if state.reject_sends {
            return Err(TransportError::publish("rejected by broker"));
        }
        state.sent.push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.events = None;
        state.closes += 1;
        Ok(())
    }
}
