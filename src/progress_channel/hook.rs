use super::core::{MessageHandler, ProgressChannel, ResyncHandler, Subscription};
use super::transport::EventStreamConnector;
use crate::api::upload::models::ConnectionStatus;
use crate::config::UploadConfig;
use std::sync::Arc;
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingKey {
    url: String,
    token: Option<String>,
    enabled: bool,
}

struct Binding {
    channel: ProgressChannel,
    _status: Subscription,
}

/// 把进度通道的生命周期绑定到 (url, token, enabled) 三元组上：
/// 三元组变化时先拆掉旧通道再建新通道，任何连接都不会比它的三元组活得更久。
pub struct ChannelHook {
    connector: Arc<dyn EventStreamConnector>,
    config: UploadConfig,
    key: Option<BindingKey>,
    binding: Option<Binding>,
    handler: Option<MessageHandler>,
    resync: Option<ResyncHandler>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ChannelHook {
    pub fn new(connector: Arc<dyn EventStreamConnector>, config: UploadConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            connector,
            config,
            key: None,
            binding: None,
            handler: None,
            resync: None,
            status_tx,
        }
    }

    /// 三元组未变化时什么也不做。token 缺失、url 为空或未启用时不创建通道。
    pub fn bind(&mut self, url: &str, token: Option<&str>, enabled: bool) {
        let key = BindingKey {
            url: url.trim().to_string(),
            token: token.map(str::to_string),
            enabled,
        };
        if self.key.as_ref() == Some(&key) {
            return;
        }
        self.teardown();
        self.key = Some(key.clone());

        let token = match key.token {
            Some(token) if enabled && !token.is_empty() && !key.url.is_empty() => token,
            _ => {
                debug!(enabled, "progress channel not created for incomplete binding");
                return;
            }
        };
        let url = match Url::parse(&key.url) {
            Ok(url) => url,
            Err(err) => {
                error!(url = %key.url, %err, "invalid progress stream url");
                return;
            }
        };

        let channel = ProgressChannel::new(self.connector.clone(), url, token, &self.config);
        let status_tx = self.status_tx.clone();
        let status = channel.on_connection_status_change(move |status| {
            status_tx.send_replace(status);
        });
        self.binding = Some(Binding {
            channel,
            _status: status,
        });
    }

    /// 拆掉当前通道并忘记三元组。
    pub fn unbind(&mut self) {
        self.teardown();
        self.key = None;
    }

    pub fn set_resync_handler(&mut self, resync: Option<ResyncHandler>) {
        self.resync = resync;
    }

    /// 在运行时上启动连接并记住处理函数。尚未绑定通道时记录错误后直接返回。
    pub fn subscribe(&mut self, handler: MessageHandler) {
        let Some(binding) = self.binding.as_ref() else {
            error!("subscribe called before a progress channel was bound");
            return;
        };
        spawn_connect(&binding.channel, handler.clone(), self.resync.clone());
        self.handler = Some(handler);
    }

    pub fn unsubscribe(&mut self) {
        if let Some(binding) = self.binding.as_ref() {
            binding.channel.disconnect();
        }
        self.handler = None;
    }

    /// 手动恢复：断开后用最近一次注册的处理函数重新连接。
    pub fn reconnect(&mut self) {
        let Some(binding) = self.binding.as_ref() else {
            error!("reconnect called without a bound progress channel");
            return;
        };
        let Some(handler) = self.handler.clone() else {
            warn!("reconnect called before any subscription");
            return;
        };
        binding.channel.disconnect();
        spawn_connect(&binding.channel, handler, self.resync.clone());
    }

    pub fn channel(&self) -> Option<&ProgressChannel> {
        self.binding.as_ref().map(|b| &b.channel)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.binding
            .as_ref()
            .map(|b| b.channel.connection_status())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connected
    }

    /// 跟随当前绑定通道的状态，绑定变化后仍然有效。
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    fn teardown(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.channel.disconnect();
            debug!(url = %binding.channel.url(), "progress channel torn down");
        }
        self.handler = None;
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
    }
}

impl Drop for ChannelHook {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn spawn_connect(channel: &ProgressChannel, handler: MessageHandler, resync: Option<ResyncHandler>) {
    let Ok(runtime) = Handle::try_current() else {
        error!("no tokio runtime available; progress channel not started");
        return;
    };
    // 在当前线程就挂上中止令牌，随后的 teardown 即使先于任务执行也能拦下它。
    let connecting = channel.connect(handler, resync);
    let url = channel.url().clone();
    runtime.spawn(async move {
        if let Err(err) = connecting.await {
            error!(%url, %err, "progress channel stopped");
        }
    });
}
