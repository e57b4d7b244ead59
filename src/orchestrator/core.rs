use crate::api::upload::{
    backend::{HttpUploadApi, UploadApi},
    client::ApiCredentials,
    models::{
        CompletionSource, ConnectionStatus, PhotoSnapshot, ProgressMessage, SessionSummary,
        UploadProgress, UploadStatus, UploadTask,
    },
};
use crate::config::UploadConfig;
use crate::error::Result;
use crate::progress_channel::{ChannelHook, EventStreamConnector, HttpEventStreamConnector};
use crate::upload_engine::core::recover_lock;
use crate::upload_engine::{SessionCallbacks, UploadEngine};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

pub type SummaryCallback = Arc<dyn Fn(&SessionSummary) + Send + Sync>;

/// 一次性闸门：只有第一个 `try_fire` 返回 true。
#[derive(Debug, Default)]
pub struct CompletionLatch {
    fired: AtomicBool,
}

impl CompletionLatch {
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// 把上传引擎、进度通道与后端快照组合起来，保证每个会话只交出一次汇总。
pub struct UploadOrchestrator {
    engine: UploadEngine,
    api: Arc<dyn UploadApi>,
    connector: Arc<dyn EventStreamConnector>,
    config: UploadConfig,
}

impl UploadOrchestrator {
    pub fn new(
        engine: UploadEngine,
        api: Arc<dyn UploadApi>,
        connector: Arc<dyn EventStreamConnector>,
        config: UploadConfig,
    ) -> Self {
        Self {
            engine,
            api,
            connector,
            config: config.normalized(),
        }
    }

    pub fn http(config: UploadConfig) -> Result<Self> {
        let engine = UploadEngine::http(config.clone())?;
        let api = HttpUploadApi::new(config.request_timeout())?;
        let connector = HttpEventStreamConnector::new()?;
        Ok(Self::new(engine, Arc::new(api), Arc::new(connector), config))
    }

    pub fn engine(&self) -> &UploadEngine {
        &self.engine
    }

    pub async fn start(
        &self,
        tasks: Vec<UploadTask>,
        credentials: ApiCredentials,
    ) -> Result<UploadRun> {
        self.start_with(tasks, credentials, None).await
    }

    /// 启动会话并订阅进度流。`on_summary` 与 `UploadRun::wait` 收到同一份汇总，且只有一次。
    pub async fn start_with(
        &self,
        tasks: Vec<UploadTask>,
        credentials: ApiCredentials,
        on_summary: Option<SummaryCallback>,
    ) -> Result<UploadRun> {
        let (summary_tx, summary_rx) = oneshot::channel();
        let run = Arc::new(RunShared {
            session_id: OnceLock::new(),
            total: tasks.len() as u32,
            credentials: credentials.clone(),
            api: self.api.clone(),
            engine: self.engine.clone(),
            fallback_delay: self.config.completion_fallback(),
            runtime: Handle::try_current().ok(),
            progress: Mutex::new(ProgressMap::default()),
            latch: CompletionLatch::default(),
            fallback: Mutex::new(None),
            summary_tx: Mutex::new(Some(summary_tx)),
            on_summary,
            hook: Mutex::new(ChannelHook::new(self.connector.clone(), self.config.clone())),
        });

        let on_progress = Arc::downgrade(&run);
        let on_complete = Arc::downgrade(&run);
        let callbacks = SessionCallbacks::new()
            .on_progress(move |record| {
                if let Some(run) = on_progress.upgrade() {
                    run.record_local(record);
                }
            })
            .on_complete(move |session_id| {
                if let Some(run) = on_complete.upgrade() {
                    run.arm_fallback(session_id);
                }
            });

        let session_id = self
            .engine
            .start_upload_session(tasks, credentials, callbacks)
            .await?;
        let _ = run.session_id.set(session_id);
        run.bind_channel();

        Ok(UploadRun {
            shared: run,
            summary_rx: Some(summary_rx),
        })
    }
}

/// 一次上传会话的句柄。drop 时断开进度流，并丢弃引擎里该会话的已结束记录。
pub struct UploadRun {
    shared: Arc<RunShared>,
    summary_rx: Option<oneshot::Receiver<SessionSummary>>,
}

impl UploadRun {
    pub fn session_id(&self) -> &str {
        self.shared.session_id()
    }

    /// 等待会话汇总。会话被取消或已经取走过汇总时返回 `None`。
    pub async fn wait(&mut self) -> Option<SessionSummary> {
        let rx = self.summary_rx.take()?;
        rx.await.ok()
    }

    /// 本地观察到的进度，按任务 id 排序。
    pub fn progress_snapshot(&self) -> Vec<UploadProgress> {
        let mut records: Vec<UploadProgress> = recover_lock(&self.shared.progress)
            .entries
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        records
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        recover_lock(&self.shared.hook).connection_status()
    }

    /// 手动恢复进度流。
    pub fn reconnect(&self) {
        recover_lock(&self.shared.hook).reconnect();
    }

    /// 取消引擎会话并断开进度流，不再产生汇总。
    pub fn cancel(&self) -> Option<Vec<UploadProgress>> {
        self.shared.latch.try_fire();
        self.shared.stop_fallback();
        recover_lock(&self.shared.summary_tx).take();
        let records = self.shared.engine.cancel_session(self.session_id());
        recover_lock(&self.shared.hook).unbind();
        info!(session_id = %self.session_id(), "upload run cancelled");
        records
    }
}

impl Drop for UploadRun {
    fn drop(&mut self) {
        self.shared.stop_fallback();
        recover_lock(&self.shared.hook).unbind();
        self.shared.engine.forget_session(self.session_id());
    }
}

/// 按照片 id 记录进度；照片 id 未知前用任务 id，拿到照片 id 后迁移。
#[derive(Default)]
struct ProgressMap {
    entries: HashMap<String, UploadProgress>,
}

impl ProgressMap {
    fn merge_local(&mut self, record: &UploadProgress) {
        let key = match record.photo_id.as_ref() {
            Some(photo_id) => {
                if let Some(previous) = self.entries.remove(&record.task_id) {
                    self.entries.entry(photo_id.clone()).or_insert(previous);
                }
                photo_id.clone()
            }
            None => record.task_id.clone(),
        };
        match self.entries.get(&key) {
            Some(existing) if existing.status.is_terminal() && !record.status.is_terminal() => {}
            _ => {
                self.entries.insert(key, record.clone());
            }
        }
    }

    fn mark_remote(&mut self, photo_id: &str, status: UploadStatus, reason: Option<String>) {
        let entry = self
            .entries
            .entry(photo_id.to_string())
            .or_insert_with(|| UploadProgress {
                task_id: photo_id.to_string(),
                photo_id: Some(photo_id.to_string()),
                status: UploadStatus::Queued,
                progress: 0,
                bytes_uploaded: 0,
                total_bytes: 0,
                error: None,
            });
        entry.status = status;
        if status == UploadStatus::Completed {
            entry.progress = 100;
            entry.bytes_uploaded = entry.total_bytes;
            entry.error = None;
        } else {
            entry.error = reason;
        }
    }

    fn replace(&mut self, photos: &[PhotoSnapshot]) {
        self.entries = photos
            .iter()
            .map(|photo| (photo.id.clone(), photo.to_progress()))
            .collect();
    }

    fn counts(&self) -> (u32, u32) {
        self.entries
            .values()
            .fold((0, 0), |(done, failed), record| match record.status {
                UploadStatus::Completed => (done + 1, failed),
                UploadStatus::Failed => (done, failed + 1),
                _ => (done, failed),
            })
    }
}

struct RunShared {
    session_id: OnceLock<String>,
    total: u32,
    credentials: ApiCredentials,
    api: Arc<dyn UploadApi>,
    engine: UploadEngine,
    fallback_delay: Duration,
    runtime: Option<Handle>,
    progress: Mutex<ProgressMap>,
    latch: CompletionLatch,
    fallback: Mutex<Option<JoinHandle<()>>>,
    summary_tx: Mutex<Option<oneshot::Sender<SessionSummary>>>,
    on_summary: Option<SummaryCallback>,
    hook: Mutex<ChannelHook>,
}

impl RunShared {
    fn session_id(&self) -> &str {
        self.session_id.get().map(String::as_str).unwrap_or_default()
    }

    fn spawn<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let runtime = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok());
        match runtime {
            Some(runtime) => Some(runtime.spawn(future)),
            None => {
                error!(session_id = %self.session_id(), "no tokio runtime available");
                None
            }
        }
    }

    fn bind_channel(self: &Arc<Self>) {
        let url = match self.credentials.stream_url(self.session_id()) {
            Ok(url) => url,
            Err(err) => {
                error!(session_id = %self.session_id(), %err, "cannot build progress stream url");
                return;
            }
        };

        let on_message = Arc::downgrade(self);
        let on_resync = Arc::downgrade(self);
        {
            let mut hook = recover_lock(&self.hook);
            hook.bind(url.as_str(), Some(self.credentials.token()), true);
            if hook.channel().is_none() {
                warn!(session_id = %self.session_id(), "no progress channel; relying on local completion");
                return;
            }
            hook.set_resync_handler(Some(Arc::new(move || {
                if let Some(run) = on_resync.upgrade() {
                    run.resync();
                }
            })));
            hook.subscribe(Arc::new(move |message| {
                if let Some(run) = on_message.upgrade() {
                    run.handle_message(message);
                }
            }));
        }
        // 会话可能在绑定之前就已经结束。
        if self.latch.is_fired() {
            recover_lock(&self.hook).unbind();
        }
    }

    fn record_local(&self, record: &UploadProgress) {
        recover_lock(&self.progress).merge_local(record);
    }

    fn handle_message(self: &Arc<Self>, message: ProgressMessage) {
        if message.session_id() != self.session_id() {
            debug!(
                session_id = %self.session_id(),
                other = %message.session_id(),
                "ignoring progress message for another session"
            );
            return;
        }
        match message {
            ProgressMessage::PhotoUploaded(m) => {
                recover_lock(&self.progress).mark_remote(&m.photo_id, UploadStatus::Completed, None);
            }
            ProgressMessage::PhotoFailed(m) => {
                recover_lock(&self.progress).mark_remote(
                    &m.photo_id,
                    UploadStatus::Failed,
                    Some(m.reason),
                );
            }
            ProgressMessage::SessionCompleted(m) => {
                self.stop_fallback();
                self.finish(SessionSummary::from(m));
            }
        }
    }

    /// 本地全部结束后等待一个固定窗口，期间没有收到服务端的完成消息就用本地计数收尾。
    fn arm_fallback(self: &Arc<Self>, session_id: &str) {
        if self.latch.is_fired() {
            return;
        }
        let weak: Weak<RunShared> = Arc::downgrade(self);
        let delay = self.fallback_delay;
        debug!(%session_id, delay_ms = delay.as_millis() as u64, "arming completion fallback");
        let handle = self.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(run) = weak.upgrade() {
                run.complete_locally();
            }
        });
        let previous = std::mem::replace(&mut *recover_lock(&self.fallback), handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_fallback(&self) {
        if let Some(handle) = recover_lock(&self.fallback).take() {
            handle.abort();
        }
    }

    fn complete_locally(&self) {
        // 定时器任务自身不需要 abort。
        recover_lock(&self.fallback).take();
        let (uploaded, failed) = {
            let progress = recover_lock(&self.progress);
            if progress.entries.is_empty() {
                (self.total, 0)
            } else {
                progress.counts()
            }
        };
        warn!(
            session_id = %self.session_id(),
            "no completion message from server; finishing with local counts"
        );
        self.finish(SessionSummary {
            session_id: self.session_id().to_string(),
            uploaded_count: uploaded,
            failed_count: failed,
            total_count: self.total,
            source: CompletionSource::LocalFallback,
        });
    }

    fn finish(&self, summary: SessionSummary) {
        if !self.latch.try_fire() {
            debug!(session_id = %self.session_id(), "session summary already delivered");
            return;
        }
        info!(
            session_id = %summary.session_id,
            uploaded = summary.uploaded_count,
            failed = summary.failed_count,
            total = summary.total_count,
            source = ?summary.source,
            "upload session complete"
        );
        if let Some(tx) = recover_lock(&self.summary_tx).take() {
            let _ = tx.send(summary.clone());
        }
        if let Some(on_summary) = self.on_summary.as_ref() {
            on_summary(&summary);
        }
        recover_lock(&self.hook).unbind();
    }

    /// 重新拉取权威快照并整体替换本地进度；拉取失败时保留现有数据。
    fn resync(self: &Arc<Self>) {
        if self.latch.is_fired() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.spawn(async move {
            let Some(run) = weak.upgrade() else {
                return;
            };
            match run
                .api
                .session_snapshot(&run.credentials, run.session_id())
                .await
            {
                Ok(snapshot) => {
                    recover_lock(&run.progress).replace(&snapshot.photos);
                    debug!(
                        session_id = %run.session_id(),
                        photos = snapshot.photos.len(),
                        "progress resynchronised from snapshot"
                    );
                }
                Err(err) => {
                    error!(session_id = %run.session_id(), %err, "failed to resync session progress");
                }
            }
        });
    }
}
