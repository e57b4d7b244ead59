use super::multipart::{part_progress, upload_parts};
use super::storage::{pending_landing, LandingJournal};
use crate::api::upload::{
    backend::{HttpUploadApi, UploadApi},
    client::ApiCredentials,
    models::{
        CreateSessionRequest, InitiatePhotoRequest, MarkUploadedRequest, UploadDescriptor,
        UploadProgress, UploadStatus, UploadTarget, UploadTask,
    },
    storage::{percent_of, HttpObjectStorage, ObjectStorage, TransferProgress},
};
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::settings::clamp_upload_concurrency;
use crate::validation::validate_selection;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// 已结束会话最多保留这么多份进度记录，超出时丢弃最早的。
pub const FINISHED_SESSION_LIMIT: usize = 32;

pub type ProgressCallback = Arc<dyn Fn(&UploadProgress) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// 会话级回调。三者均可缺省，回调总是在释放内部锁之后调用。
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, callback: impl Fn(&UploadProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_complete(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// 广播给 `subscribe()` 订阅者的引擎事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Progress {
        session_id: String,
        progress: UploadProgress,
    },
    TaskFailed {
        session_id: String,
        task_id: String,
        message: String,
    },
    SessionCompleted {
        session_id: String,
    },
}

/// 上传引擎：有界并发的 FIFO 队列，负责逐文件向预签名地址推送字节，
/// 维护每个文件的进度，并在整批结束时恰好通知一次。
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    api: Arc<dyn UploadApi>,
    storage: Arc<dyn ObjectStorage>,
    config: UploadConfig,
    journal: Mutex<Option<Arc<dyn LandingJournal>>>,
    max_concurrent: AtomicUsize,
    sessions: Mutex<HashMap<String, SessionState>>,
    history: Mutex<VecDeque<(String, Vec<UploadProgress>)>>,
    scheduler: Mutex<Scheduler>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
}

#[derive(Default)]
struct Scheduler {
    queue: VecDeque<UploadJob>,
    active: usize,
    runtime: Option<Handle>,
}

struct UploadJob {
    session_id: String,
    task: UploadTask,
    credentials: ApiCredentials,
    cancel: CancellationToken,
}

struct SessionState {
    tasks: Vec<UploadProgress>,
    callbacks: SessionCallbacks,
    cancel: CancellationToken,
}

impl UploadEngine {
    pub fn new(
        api: Arc<dyn UploadApi>,
        storage: Arc<dyn ObjectStorage>,
        config: UploadConfig,
    ) -> Self {
        let config = config.normalized();
        Self {
            inner: Arc::new(EngineInner {
                api,
                storage,
                max_concurrent: AtomicUsize::new(config.max_concurrent_uploads),
                config,
                journal: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                scheduler: Mutex::new(Scheduler::default()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 使用 reqwest 实现的后端与对象存储客户端构建引擎。
    pub fn http(config: UploadConfig) -> Result<Self> {
        let api = HttpUploadApi::new(config.request_timeout())?;
        let storage = HttpObjectStorage::new(config.upload_timeout())?;
        Ok(Self::new(Arc::new(api), Arc::new(storage), config))
    }

    pub fn set_landing_journal(&self, journal: Arc<dyn LandingJournal>) {
        *recover_lock(&self.inner.journal) = Some(journal);
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst)
    }

    /// 调整并行上传数（收敛到 1–20）。只影响之后的调度，不会中断在途任务。
    pub fn set_max_concurrent(&self, max: usize) -> usize {
        let clamped = clamp_upload_concurrency(max);
        self.inner.max_concurrent.store(clamped, Ordering::SeqCst);
        debug!(max_concurrent = clamped, "upload concurrency updated");
        self.pump();
        clamped
    }

    pub fn active_uploads(&self) -> usize {
        recover_lock(&self.inner.scheduler).active
    }

    pub fn queued_jobs(&self) -> usize {
        recover_lock(&self.inner.scheduler).queue.len()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        recover_lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// 建立上传会话并把每个文件排入队列，返回后端分配的会话 id。
    /// 建会话失败时不会留下任何排队任务。
    pub async fn start_upload_session(
        &self,
        tasks: Vec<UploadTask>,
        credentials: ApiCredentials,
        callbacks: SessionCallbacks,
    ) -> Result<String> {
        validate_selection(&tasks, &self.inner.config)?;

        let request = CreateSessionRequest {
            total_photos: tasks.len() as u32,
            total_size_bytes: tasks.iter().map(|t| t.size).sum(),
        };
        let response = self
            .inner
            .api
            .create_session(&credentials, &request)
            .await
            .map_err(|err| {
                error!(%err, "failed to create upload session");
                UploadError::SessionStart(err.to_string())
            })?;
        let session_id = response.session_id;

        let cancel = CancellationToken::new();
        {
            let mut sessions = recover_lock(&self.inner.sessions);
            if sessions.contains_key(&session_id) {
                return Err(UploadError::SessionStart(format!(
                    "session {session_id} is already active"
                )));
            }
            sessions.insert(
                session_id.clone(),
                SessionState {
                    tasks: tasks.iter().map(UploadProgress::queued).collect(),
                    callbacks,
                    cancel: cancel.clone(),
                },
            );
        }
        {
            let mut scheduler = recover_lock(&self.inner.scheduler);
            if let Ok(runtime) = Handle::try_current() {
                scheduler.runtime = Some(runtime);
            }
            for task in tasks {
                scheduler.queue.push_back(UploadJob {
                    session_id: session_id.clone(),
                    task,
                    credentials: credentials.clone(),
                    cancel: cancel.clone(),
                });
            }
        }

        info!(
            %session_id,
            photos = request.total_photos,
            bytes = request.total_size_bytes,
            "upload session started"
        );
        self.pump();
        Ok(session_id)
    }

    /// 取消会话：丢弃尚未调度的任务，把未结束的文件标记为失败，
    /// 并中断在途请求。返回会话最终的进度记录。
    pub fn cancel_session(&self, session_id: &str) -> Option<Vec<UploadProgress>> {
        let state = recover_lock(&self.inner.sessions).remove(session_id)?;
        let dropped = {
            let mut scheduler = recover_lock(&self.inner.scheduler);
            let before = scheduler.queue.len();
            scheduler.queue.retain(|job| job.session_id != session_id);
            before - scheduler.queue.len()
        };
        state.cancel.cancel();

        let SessionState {
            mut tasks,
            callbacks,
            ..
        } = state;
        let mut changed = Vec::new();
        for record in tasks.iter_mut() {
            if !record.status.is_terminal() {
                record.status = UploadStatus::Failed;
                record.error = Some(CANCELLED_MESSAGE.to_string());
                changed.push(record.clone());
            }
        }
        self.remember(session_id, tasks.clone());

        info!(%session_id, dropped, cancelled = changed.len(), "upload session cancelled");
        for record in &changed {
            self.emit_progress(session_id, record, &callbacks);
        }
        Some(tasks)
    }

    pub fn get_session_status(&self, session_id: &str) -> Option<Vec<UploadProgress>> {
        if let Some(state) = recover_lock(&self.inner.sessions).get(session_id) {
            return Some(state.tasks.clone());
        }
        recover_lock(&self.inner.history)
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .map(|(_, tasks)| tasks.clone())
    }

    /// 丢弃一个已结束会话的进度记录。进行中的会话不受影响。
    pub fn forget_session(&self, session_id: &str) -> Option<Vec<UploadProgress>> {
        let mut history = recover_lock(&self.inner.history);
        let index = history.iter().position(|(id, _)| id == session_id)?;
        history.remove(index).map(|(_, tasks)| tasks)
    }

    /// 清掉已结束会话的进度记录。
    pub fn clear_history(&self) {
        recover_lock(&self.inner.history).clear();
    }

    fn remember(&self, session_id: &str, tasks: Vec<UploadProgress>) {
        let mut history = recover_lock(&self.inner.history);
        history.retain(|(id, _)| id != session_id);
        history.push_back((session_id.to_string(), tasks));
        while history.len() > FINISHED_SESSION_LIMIT {
            if let Some((evicted, _)) = history.pop_front() {
                debug!(session_id = %evicted, "dropping oldest finished session record");
            }
        }
    }

    /// 补发之前失败的落盘通知，返回本次成功送达的数量。不改变任何任务状态。
    pub async fn reconcile_landings(&self, credentials: &ApiCredentials) -> usize {
        let Some(journal) = self.journal() else {
            return 0;
        };
        let mut delivered = 0;
        for landing in journal.load() {
            let request = MarkUploadedRequest {
                s3_key: landing.s3_key.clone(),
            };
            match self
                .inner
                .api
                .mark_uploaded(credentials, &landing.photo_id, &request)
                .await
            {
                Ok(()) => {
                    journal.remove(&landing.photo_id);
                    delivered += 1;
                }
                Err(err) => {
                    warn!(photo_id = %landing.photo_id, %err, "landing notification still failing");
                    journal.record(&pending_landing(
                        &landing.photo_id,
                        &landing.session_id,
                        &landing.s3_key,
                        landing.attempts + 1,
                        err.to_string(),
                    ));
                }
            }
        }
        if delivered > 0 {
            info!(delivered, "reconciled pending landing notifications");
        }
        delivered
    }

    fn journal(&self) -> Option<Arc<dyn LandingJournal>> {
        recover_lock(&self.inner.journal).clone()
    }

    /// 按 FIFO 顺序把排队任务交给运行时，直到占满并发额度。
    fn pump(&self) {
        loop {
            let (job, runtime) = {
                let mut scheduler = recover_lock(&self.inner.scheduler);
                if scheduler.active >= self.max_concurrent() || scheduler.queue.is_empty() {
                    return;
                }
                // 优先用调用方所在的运行时；缓存的句柄只在运行时之外调用时兜底。
                let Some(runtime) = Handle::try_current()
                    .ok()
                    .or_else(|| scheduler.runtime.clone())
                else {
                    warn!("no tokio runtime available; upload jobs stay queued");
                    return;
                };
                let Some(job) = scheduler.queue.pop_front() else {
                    return;
                };
                scheduler.active += 1;
                (job, runtime)
            };
            let engine = self.clone();
            runtime.spawn(async move {
                engine.run_job(job).await;
                engine.release_slot();
            });
        }
    }

    fn release_slot(&self) {
        {
            let mut scheduler = recover_lock(&self.inner.scheduler);
            scheduler.active = scheduler.active.saturating_sub(1);
        }
        self.pump();
    }

    /// 单个文件的完整流程。所有错误都在这里消化，不会越过任务边界。
    async fn run_job(&self, job: UploadJob) {
        let UploadJob {
            session_id,
            task,
            credentials,
            cancel,
        } = job;
        if !self.begin_task(&session_id, &task.id) {
            debug!(%session_id, task_id = %task.id, "skipping job for inactive task");
            return;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            result = self.transfer(&session_id, &task, &credentials) => result,
        };

        match outcome {
            Ok(descriptor) => {
                self.mark_completed(&session_id, &task.id);
                self.notify_landed(&session_id, &credentials, &descriptor).await;
            }
            Err(UploadError::Cancelled) => {
                debug!(%session_id, task_id = %task.id, "in-flight upload aborted");
            }
            Err(err) => {
                warn!(%session_id, task_id = %task.id, %err, "photo upload failed");
                self.mark_failed(&session_id, &task.id, err.to_string());
            }
        }
        self.finish_if_complete(&session_id);
    }

    async fn transfer(
        &self,
        session_id: &str,
        task: &UploadTask,
        credentials: &ApiCredentials,
    ) -> Result<UploadDescriptor> {
        let request = InitiatePhotoRequest {
            filename: task.file_name.clone(),
            file_size_bytes: task.size,
            mime_type: task.mime_type.clone(),
        };
        let descriptor = self
            .inner
            .api
            .initiate_photo(credentials, session_id, &request)
            .await?;
        self.attach_photo_id(session_id, &task.id, &descriptor.photo_id);

        let target = descriptor.target()?;
        let body = task.source.read_all().await?;
        match target {
            UploadTarget::Single(url) => {
                let engine = self.clone();
                let sid = session_id.to_string();
                let tid = task.id.clone();
                let progress: TransferProgress = Arc::new(move |sent, total| {
                    engine.report_progress(&sid, &tid, percent_of(sent, total));
                });
                self.inner
                    .storage
                    .put_object(url, &task.mime_type, body, Some(progress))
                    .await?;
            }
            UploadTarget::Multipart(part_urls) => {
                upload_parts(
                    self.inner.storage.clone(),
                    part_urls,
                    body,
                    &task.mime_type,
                    self.inner.config.part_size_bytes,
                    self.inner.config.part_concurrency,
                    |done, total| {
                        self.report_progress(session_id, &task.id, part_progress(done, total))
                    },
                )
                .await?;
            }
        }
        Ok(descriptor)
    }

    /// 通知后端对象已落盘。失败只记日志（以及落盘日志），文件状态保持已完成。
    async fn notify_landed(
        &self,
        session_id: &str,
        credentials: &ApiCredentials,
        descriptor: &UploadDescriptor,
    ) {
        let request = MarkUploadedRequest {
            s3_key: descriptor.s3_key.clone(),
        };
        match self
            .inner
            .api
            .mark_uploaded(credentials, &descriptor.photo_id, &request)
            .await
        {
            Ok(()) => {
                debug!(%session_id, photo_id = %descriptor.photo_id, "backend notified of upload")
            }
            Err(err) => {
                warn!(
                    %session_id,
                    photo_id = %descriptor.photo_id,
                    %err,
                    "failed to notify backend of upload completion; photo is in storage"
                );
                if let Some(journal) = self.journal() {
                    journal.record(&pending_landing(
                        &descriptor.photo_id,
                        session_id,
                        &descriptor.s3_key,
                        1,
                        err.to_string(),
                    ));
                }
            }
        }
    }

    fn update_task<F>(
        &self,
        session_id: &str,
        task_id: &str,
        apply: F,
    ) -> Option<(UploadProgress, SessionCallbacks)>
    where
        F: FnOnce(&mut UploadProgress) -> bool,
    {
        let mut sessions = recover_lock(&self.inner.sessions);
        let state = sessions.get_mut(session_id)?;
        let record = state.tasks.iter_mut().find(|t| t.task_id == task_id)?;
        if !apply(record) {
            return None;
        }
        Some((record.clone(), state.callbacks.clone()))
    }

    fn begin_task(&self, session_id: &str, task_id: &str) -> bool {
        let updated = self.update_task(session_id, task_id, |record| {
            if record.status != UploadStatus::Queued {
                return false;
            }
            record.status = UploadStatus::Uploading;
            record.progress = 0;
            true
        });
        match updated {
            Some((record, callbacks)) => {
                self.emit_progress(session_id, &record, &callbacks);
                true
            }
            None => false,
        }
    }

    fn attach_photo_id(&self, session_id: &str, task_id: &str, photo_id: &str) {
        let updated = self.update_task(session_id, task_id, |record| {
            record.photo_id = Some(photo_id.to_string());
            true
        });
        if let Some((record, callbacks)) = updated {
            self.emit_progress(session_id, &record, &callbacks);
        }
    }

    fn report_progress(&self, session_id: &str, task_id: &str, percent: u8) {
        let percent = percent.min(100);
        let updated = self.update_task(session_id, task_id, |record| {
            if record.status != UploadStatus::Uploading || percent <= record.progress {
                return false;
            }
            record.progress = percent;
            record.bytes_uploaded =
                ((percent as f64 / 100.0) * record.total_bytes as f64).round() as u64;
            true
        });
        if let Some((record, callbacks)) = updated {
            self.emit_progress(session_id, &record, &callbacks);
        }
    }

    fn mark_completed(&self, session_id: &str, task_id: &str) {
        let updated = self.update_task(session_id, task_id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            record.status = UploadStatus::Completed;
            record.progress = 100;
            record.bytes_uploaded = record.total_bytes;
            record.error = None;
            true
        });
        if let Some((record, callbacks)) = updated {
            self.emit_progress(session_id, &record, &callbacks);
        }
    }

    fn mark_failed(&self, session_id: &str, task_id: &str, message: String) {
        let updated = self.update_task(session_id, task_id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            record.status = UploadStatus::Failed;
            record.error = Some(message.clone());
            true
        });
        if let Some((record, callbacks)) = updated {
            self.emit_progress(session_id, &record, &callbacks);
            if let Some(on_error) = callbacks.on_error.as_ref() {
                on_error(task_id, &message);
            }
            self.broadcast(EngineEvent::TaskFailed {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
                message,
            });
        }
    }

    /// 所有文件都进入终态时移出会话并通知一次；移出发生在锁内，保证只通知一次。
    fn finish_if_complete(&self, session_id: &str) {
        let finished = {
            let mut sessions = recover_lock(&self.inner.sessions);
            let all_terminal = sessions
                .get(session_id)
                .is_some_and(|state| state.tasks.iter().all(|t| t.status.is_terminal()));
            if all_terminal {
                sessions.remove(session_id)
            } else {
                None
            }
        };
        let Some(state) = finished else {
            return;
        };

        let completed = state
            .tasks
            .iter()
            .filter(|t| t.status == UploadStatus::Completed)
            .count();
        let failed = state.tasks.len() - completed;
        self.remember(session_id, state.tasks);
        info!(%session_id, completed, failed, "upload session finished locally");

        if let Some(on_complete) = state.callbacks.on_complete.as_ref() {
            on_complete(session_id);
        }
        self.broadcast(EngineEvent::SessionCompleted {
            session_id: session_id.to_string(),
        });
    }

    fn emit_progress(&self, session_id: &str, record: &UploadProgress, callbacks: &SessionCallbacks) {
        if let Some(on_progress) = callbacks.on_progress.as_ref() {
            on_progress(record);
        }
        self.broadcast(EngineEvent::Progress {
            session_id: session_id.to_string(),
            progress: record.clone(),
        });
    }

    fn broadcast(&self, event: EngineEvent) {
        let mut subs = recover_lock(&self.inner.subscribers);
        subs.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

pub(crate) fn recover_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}
