use super::parser::{SseEvent, SseParser};
use super::transport::{EventStreamBody, EventStreamConnector, HttpEventStreamConnector};
use crate::api::upload::models::{ConnectionStatus, ProgressMessage};
use crate::config::UploadConfig;
use crate::error::{ChannelError, Result};
use crate::upload_engine::core::recover_lock;
use futures::StreamExt;
use rand::Rng;
use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

pub type MessageHandler = Arc<dyn Fn(ProgressMessage) + Send + Sync>;
pub type ResyncHandler = Arc<dyn Fn() + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// 单个会话的进度推送连接。同一时刻只维持一条逻辑连接，
/// 令牌只放在请求头里。
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    connector: Arc<dyn EventStreamConnector>,
    url: Url,
    token: Mutex<String>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    state: Mutex<ChannelState>,
    handlers: Mutex<Vec<(u64, StatusHandler)>>,
    next_handler_id: AtomicU64,
}

struct ChannelState {
    status: ConnectionStatus,
    abort: CancellationToken,
    attempts: u32,
    last_event_id: Option<String>,
    retry_override: Option<Duration>,
    /// 按写入顺序排队等待派发的状态；同一时刻只有一个线程在派发。
    pending: VecDeque<ConnectionStatus>,
    dispatching: bool,
}

/// 状态回调的注册句柄。drop 或 `unsubscribe()` 只移除这一个回调。
#[must_use = "dropping a Subscription unregisters the handler"]
pub struct Subscription {
    id: u64,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            recover_lock(&inner.handlers).retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamVerdict {
    Accept,
    Retry(String),
    Fatal(ChannelError),
}

enum StreamEnd {
    Aborted,
    Closed,
    Failed(String),
}

impl ProgressChannel {
    pub fn new(
        connector: Arc<dyn EventStreamConnector>,
        url: Url,
        token: impl Into<String>,
        config: &UploadConfig,
    ) -> Self {
        let abort = CancellationToken::new();
        abort.cancel();
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                url,
                token: Mutex::new(token.into()),
                max_attempts: config.max_reconnect_attempts.max(1),
                base_delay: config.reconnect_base_delay(),
                max_delay: config.reconnect_max_delay(),
                state: Mutex::new(ChannelState {
                    status: ConnectionStatus::Disconnected,
                    abort,
                    attempts: 0,
                    last_event_id: None,
                    retry_override: None,
                    pending: VecDeque::new(),
                    dispatching: false,
                }),
                handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn http(url: Url, token: impl Into<String>, config: &UploadConfig) -> Result<Self> {
        let connector = HttpEventStreamConnector::new()?;
        Ok(Self::new(Arc::new(connector), url, token, config))
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        recover_lock(&self.inner.state).status
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connected
    }

    /// 只影响之后的（重）连接，不会主动断开当前连接。
    pub fn update_auth_token(&self, token: impl Into<String>) {
        *recover_lock(&self.inner.token) = token.into();
        debug!(url = %self.inner.url, "progress stream token updated");
    }

    pub fn on_connection_status_change(
        &self,
        handler: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        recover_lock(&self.inner.handlers).push((id, Arc::new(handler)));
        Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// 幂等。正在运行或已创建但尚未轮询的 `connect()` 都会以 `Ok(())` 返回。
    pub fn disconnect(&self) {
        let changed = {
            let mut state = recover_lock(&self.inner.state);
            state.abort.cancel();
            let changed = state.status != ConnectionStatus::Disconnected;
            if changed {
                state.status = ConnectionStatus::Disconnected;
                state.pending.push_back(ConnectionStatus::Disconnected);
            }
            changed
        };
        if changed {
            debug!(url = %self.inner.url, "progress stream disconnected");
            self.flush_notifications();
        }
    }

    /// 建立连接并持续读取，直到调用 `disconnect()` 或遇到致命错误。
    /// 可重试的错误在内部按指数退避重连；每次成功打开后调用一次 `on_resync`。
    ///
    /// 调用时立即生效：返回的 future 被轮询之前调用 `disconnect()`，
    /// 它不会发起任何请求。
    pub fn connect(
        &self,
        on_message: MessageHandler,
        on_resync: Option<ResyncHandler>,
    ) -> impl Future<Output = std::result::Result<(), ChannelError>> + Send + 'static {
        let abort = {
            let mut state = recover_lock(&self.inner.state);
            state.abort.cancel();
            state.abort = CancellationToken::new();
            state.attempts = 0;
            state.abort.clone()
        };
        let channel = self.clone();
        async move { channel.run(abort, on_message, on_resync).await }
    }

    async fn run(
        &self,
        abort: CancellationToken,
        on_message: MessageHandler,
        on_resync: Option<ResyncHandler>,
    ) -> std::result::Result<(), ChannelError> {
        loop {
            if !self.transition(&abort, ConnectionStatus::Connecting) {
                return Ok(());
            }
            let (token, last_event_id) = {
                let state = recover_lock(&self.inner.state);
                (
                    recover_lock(&self.inner.token).clone(),
                    state.last_event_id.clone(),
                )
            };

            let opened = tokio::select! {
                biased;
                _ = abort.cancelled() => return Ok(()),
                opened = self.inner.connector.open(&self.inner.url, &token, last_event_id.as_deref()) => opened,
            };

            let failure = match opened {
                Ok(response) => {
                    match classify_response(response.status, response.content_type.as_deref()) {
                        StreamVerdict::Accept => {
                            if !self.transition(&abort, ConnectionStatus::Connected) {
                                return Ok(());
                            }
                            recover_lock(&self.inner.state).attempts = 0;
                            info!(url = %self.inner.url, "progress stream connected");
                            if let Some(resync) = on_resync.as_ref() {
                                resync();
                            }
                            match self.read_stream(response.body, &abort, &on_message).await {
                                StreamEnd::Aborted => return Ok(()),
                                StreamEnd::Closed => "stream closed by server".to_string(),
                                StreamEnd::Failed(reason) => reason,
                            }
                        }
                        StreamVerdict::Fatal(err) => {
                            self.transition(&abort, ConnectionStatus::Disconnected);
                            error!(url = %self.inner.url, %err, "progress stream failed permanently");
                            return Err(err);
                        }
                        StreamVerdict::Retry(reason) => reason,
                    }
                }
                Err(err) => err.to_string(),
            };

            if !self.transition(&abort, ConnectionStatus::Disconnected) {
                return Ok(());
            }
            let (attempts, base) = {
                let mut state = recover_lock(&self.inner.state);
                state.attempts += 1;
                (
                    state.attempts,
                    state.retry_override.unwrap_or(self.inner.base_delay),
                )
            };
            if attempts >= self.inner.max_attempts {
                let err = ChannelError::RetriesExhausted { attempts };
                error!(url = %self.inner.url, %err, last_error = %failure, "giving up on progress stream");
                return Err(err);
            }

            let delay = backoff_delay(base, self.inner.max_delay, attempts);
            warn!(
                url = %self.inner.url,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "progress stream interrupted; reconnecting"
            );
            tokio::select! {
                biased;
                _ = abort.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn read_stream(
        &self,
        mut body: EventStreamBody,
        abort: &CancellationToken,
        on_message: &MessageHandler,
    ) -> StreamEnd {
        let last_event_id = recover_lock(&self.inner.state).last_event_id.clone();
        let mut parser = SseParser::with_last_event_id(last_event_id);
        loop {
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => return StreamEnd::Aborted,
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    let events = parser.feed(&chunk);
                    {
                        let mut state = recover_lock(&self.inner.state);
                        state.last_event_id = parser.last_event_id().map(str::to_string);
                        if let Some(retry) = parser.retry() {
                            state.retry_override = Some(retry);
                        }
                    }
                    for event in events {
                        if abort.is_cancelled() {
                            return StreamEnd::Aborted;
                        }
                        dispatch_event(&event, on_message);
                    }
                }
                Some(Err(reason)) => return StreamEnd::Failed(reason),
                None => return StreamEnd::Closed,
            }
        }
    }

    /// 仅当本轮连接未被中止时更新状态，避免已退出的循环覆盖新状态。
    fn transition(&self, abort: &CancellationToken, status: ConnectionStatus) -> bool {
        {
            let mut state = recover_lock(&self.inner.state);
            if abort.is_cancelled() {
                return false;
            }
            if state.status == status {
                return true;
            }
            state.status = status;
            state.pending.push_back(status);
        }
        self.flush_notifications();
        true
    }

    /// 依次派发排队的状态。另一个线程（或外层的回调）正在派发时直接返回，
    /// 由它把新入队的状态按顺序送达，回调里再调用 `disconnect()` 也不会死锁。
    fn flush_notifications(&self) {
        {
            let mut state = recover_lock(&self.inner.state);
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }
        let _guard = DispatchGuard(self.inner.as_ref());
        loop {
            let next = {
                let mut state = recover_lock(&self.inner.state);
                let next = state.pending.pop_front();
                // 与判空在同一把锁内清除标记，其他线程不会把状态留在队列里。
                if next.is_none() {
                    state.dispatching = false;
                }
                next
            };
            match next {
                Some(status) => self.notify(status),
                None => return,
            }
        }
    }

    fn notify(&self, status: ConnectionStatus) {
        let handlers: Vec<StatusHandler> = recover_lock(&self.inner.handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(status);
        }
    }
}

/// 回调 panic 时释放派发权，之后的状态变化仍能送达。
struct DispatchGuard<'a>(&'a ChannelInner);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            recover_lock(&self.0.state).dispatching = false;
        }
    }
}

fn dispatch_event(event: &SseEvent, on_message: &MessageHandler) {
    match ProgressMessage::from_event(&event.event, &event.data) {
        Ok(Some(message)) => on_message(message),
        Ok(None) => debug!(event = %event.event, "ignoring unrecognised progress event"),
        Err(err) => warn!(event = %event.event, %err, "dropping malformed progress payload"),
    }
}

/// 4xx（429 除外）与内容类型不对的 2xx 视为致命；其余失败可重试。
pub(crate) fn classify_response(status: u16, content_type: Option<&str>) -> StreamVerdict {
    match status {
        200..=299 if is_event_stream(content_type) => StreamVerdict::Accept,
        200..=299 => StreamVerdict::Fatal(ChannelError::SessionEnded {
            status,
            content_type: content_type.map(str::to_string),
        }),
        429 => StreamVerdict::Retry(format!("HTTP {status}")),
        400..=499 => StreamVerdict::Fatal(ChannelError::Rejected { status }),
        _ => StreamVerdict::Retry(format!("HTTP {status}")),
    }
}

fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
}

/// 第 `attempt` 次失败后的等待时间：基数翻倍，封顶 `max`，再加 ±20% 抖动。
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let capped = base.saturating_mul(1u32 << exponent).min(max);
    let jitter: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    capped.mul_f64(jitter).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_handshake_responses() {
        assert_eq!(
            classify_response(200, Some("text/event-stream;charset=UTF-8")),
            StreamVerdict::Accept
        );
        assert!(matches!(
            classify_response(200, Some("application/json")),
            StreamVerdict::Fatal(ChannelError::SessionEnded { status: 200, .. })
        ));
        assert_eq!(
            classify_response(404, None),
            StreamVerdict::Fatal(ChannelError::Rejected { status: 404 })
        );
        assert!(matches!(classify_response(429, None), StreamVerdict::Retry(_)));
        assert!(matches!(classify_response(503, None), StreamVerdict::Retry(_)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        for _ in 0..50 {
            let first = backoff_delay(base, max, 1);
            assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
            let third = backoff_delay(base, max, 3);
            assert!(third >= Duration::from_millis(3200) && third <= Duration::from_millis(4800));
            assert!(backoff_delay(base, max, 10) <= max);
        }
    }

    #[test]
    fn subscriptions_are_independent() {
        let url = Url::parse("http://localhost/api/upload/sessions/s/stream").unwrap();
        let channel = ProgressChannel::http(url, "t", &UploadConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let seen = seen.clone();
            channel.on_connection_status_change(move |s| seen.lock().unwrap().push(("a", s)))
        };
        let _second = {
            let seen = seen.clone();
            channel.on_connection_status_change(move |s| seen.lock().unwrap().push(("b", s)))
        };
        first.unsubscribe();
        channel.notify(ConnectionStatus::Connecting);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("b", ConnectionStatus::Connecting)]
        );
    }
}
