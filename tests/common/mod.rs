#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use rapidphoto_client::api::upload::backend::UploadApi;
use rapidphoto_client::api::upload::client::ApiCredentials;
use rapidphoto_client::api::upload::models::{
    CreateSessionRequest, CreateSessionResponse, InitiatePhotoRequest, MarkUploadedRequest,
    PhotoSnapshot, SessionSnapshot, UploadDescriptor, UploadTask,
};
use rapidphoto_client::api::upload::storage::{ObjectStorage, TransferProgress};
use rapidphoto_client::error::{ChannelError, Result, UploadError};
use rapidphoto_client::progress_channel::{EventStreamConnector, StreamResponse};
use rapidphoto_client::source::MemorySource;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

pub const SESSION_ID: &str = "session-1";

pub fn credentials() -> ApiCredentials {
    ApiCredentials::new("https://api.test", "token-1").unwrap()
}

pub fn photo(id: &str, size: usize) -> UploadTask {
    UploadTask::with_id(
        id,
        format!("{id}.jpg"),
        "image/jpeg",
        size as u64,
        MemorySource::new(vec![7u8; size]),
    )
}

pub fn photo_id_for(file_name: &str) -> String {
    format!("photo-{file_name}")
}

/// 轮询直到条件成立；暂停时钟下 sleep 会自动推进。
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("operation timed out")
}

#[derive(Default)]
pub struct FakeApi {
    pub calls: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub fail_initiate: Mutex<HashSet<String>>,
    pub multipart: Mutex<HashMap<String, usize>>,
    pub fail_mark: AtomicBool,
    pub snapshot: Mutex<Option<SessionSnapshot>>,
    pub snapshot_calls: AtomicUsize,
    /// 打开后每次建会话都分配新的 id：`session-1`、`session-2`……
    pub unique_sessions: AtomicBool,
    pub sessions_created: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn fail_initiate_for(&self, file_name: &str) {
        self.fail_initiate
            .lock()
            .unwrap()
            .insert(file_name.to_string());
    }

    pub fn use_multipart(&self, file_name: &str, parts: usize) {
        self.multipart
            .lock()
            .unwrap()
            .insert(file_name.to_string(), parts);
    }

    pub fn set_snapshot(&self, photos: &[(&str, &str)]) {
        let snapshot = SessionSnapshot {
            id: Some(SESSION_ID.into()),
            photos: photos
                .iter()
                .map(|(id, status)| PhotoSnapshot {
                    id: id.to_string(),
                    filename: None,
                    upload_status: Some(status.to_string()),
                })
                .collect(),
            ..SessionSnapshot::default()
        };
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl UploadApi for FakeApi {
    async fn create_session(
        &self,
        _creds: &ApiCredentials,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        self.record(format!("create:{}", request.total_photos));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(UploadError::Http {
                context: "creating upload session".into(),
                status: 500,
                message: "boom".into(),
            });
        }
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = if self.unique_sessions.load(Ordering::SeqCst) {
            format!("session-{n}")
        } else {
            SESSION_ID.to_string()
        };
        Ok(CreateSessionResponse { session_id })
    }

    async fn initiate_photo(
        &self,
        _creds: &ApiCredentials,
        _session_id: &str,
        request: &InitiatePhotoRequest,
    ) -> Result<UploadDescriptor> {
        self.record(format!("initiate:{}", request.filename));
        if self.fail_initiate.lock().unwrap().contains(&request.filename) {
            return Err(UploadError::Http {
                context: "initiating photo upload".into(),
                status: 400,
                message: "descriptor unavailable".into(),
            });
        }
        let parts = self.multipart.lock().unwrap().get(&request.filename).copied();
        let name = &request.filename;
        Ok(UploadDescriptor {
            upload_url: parts.is_none().then(|| format!("https://s3.test/{name}")),
            part_urls: parts.map(|n| {
                (1..=n)
                    .map(|i| format!("https://s3.test/{name}/part-{i}"))
                    .collect()
            }),
            photo_id: photo_id_for(name),
            s3_key: format!("key-{name}"),
        })
    }

    async fn mark_uploaded(
        &self,
        _creds: &ApiCredentials,
        photo_id: &str,
        _request: &MarkUploadedRequest,
    ) -> Result<()> {
        self.record(format!("mark:{photo_id}"));
        if self.fail_mark.load(Ordering::SeqCst) {
            return Err(UploadError::Http {
                context: "notifying photo upload".into(),
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(())
    }

    async fn session_snapshot(
        &self,
        _creds: &ApiCredentials,
        _session_id: &str,
    ) -> Result<SessionSnapshot> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| UploadError::Http {
                context: "fetching session snapshot".into(),
                status: 502,
                message: "bad gateway".into(),
            })
    }
}

#[derive(Default)]
pub struct FakeStorage {
    pub puts: Mutex<Vec<(String, usize)>>,
    pub started: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 之后的 PUT 全部阻塞，直到测试结束。
    pub fn block_uploads(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// 放行 `n` 个被阻塞的 PUT；每个许可只用一次。
    pub fn release_uploads(&self, n: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(n);
        }
    }

    pub fn puts(&self) -> Vec<(String, usize)> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        url: &str,
        _content_type: &str,
        body: Bytes,
        progress: Option<TransferProgress>,
    ) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _leave = InFlight(&self.in_flight);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let total = body.len() as u64;
        if let Some(progress) = progress {
            progress(total / 2, total);
            progress(total / 4, total);
            progress(total, total);
        }
        self.puts.lock().unwrap().push((url.to_string(), body.len()));
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub enum Scripted {
    Respond {
        status: u16,
        content_type: Option<String>,
    },
    Stream(mpsc::UnboundedReceiver<std::result::Result<Bytes, String>>),
    Refuse(String),
}

/// 测试端持有的事件流写入口。
#[derive(Clone)]
pub struct StreamFeed {
    tx: mpsc::UnboundedSender<std::result::Result<Bytes, String>>,
}

impl StreamFeed {
    pub fn raw(&self, text: &str) {
        let _ = self.tx.unbounded_send(Ok(Bytes::from(text.to_string())));
    }

    pub fn event(&self, name: &str, json: &str) {
        self.raw(&format!("event: {name}\ndata: {json}\n\n"));
    }

    pub fn photo_uploaded(&self, photo_id: &str, uploaded: u32, total: u32) {
        self.event(
            "PHOTO_UPLOADED",
            &format!(
                r#"{{"sessionId":"{SESSION_ID}","photoId":"{photo_id}","uploadedCount":{uploaded},"totalCount":{total},"progressPercent":{}}}"#,
                uploaded * 100 / total.max(1)
            ),
        );
    }

    pub fn session_completed(&self, uploaded: u32, failed: u32, total: u32) {
        self.event(
            "SESSION_COMPLETED",
            &format!(
                r#"{{"sessionId":"{SESSION_ID}","uploadedCount":{uploaded},"failedCount":{failed},"totalCount":{total}}}"#
            ),
        );
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.tx.unbounded_send(Err(reason.to_string()));
    }
}

pub fn event_stream() -> (StreamFeed, Scripted) {
    let (tx, rx) = mpsc::unbounded();
    (StreamFeed { tx }, Scripted::Stream(rx))
}

pub fn respond(status: u16, content_type: Option<&str>) -> Scripted {
    Scripted::Respond {
        status,
        content_type: content_type.map(str::to_string),
    }
}

/// 按脚本逐次应答 `open`；脚本耗尽后挂起，模拟迟迟不响应的服务端。
#[derive(Default)]
pub struct FakeConnector {
    script: Mutex<VecDeque<Scripted>>,
    pub opens: AtomicUsize,
    pub tokens: Mutex<Vec<String>>,
    pub last_event_ids: Mutex<Vec<Option<String>>>,
}

impl FakeConnector {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    pub fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStreamConnector for FakeConnector {
    async fn open(
        &self,
        _url: &Url,
        token: &str,
        last_event_id: Option<&str>,
    ) -> std::result::Result<StreamResponse, ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.to_string());
        self.last_event_ids
            .lock()
            .unwrap()
            .push(last_event_id.map(str::to_string));
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Scripted::Respond {
                status,
                content_type,
            }) => Ok(StreamResponse {
                status,
                content_type,
                body: futures::stream::empty().boxed(),
            }),
            Some(Scripted::Stream(rx)) => Ok(StreamResponse {
                status: 200,
                content_type: Some("text/event-stream; charset=utf-8".into()),
                body: rx.boxed(),
            }),
            Some(Scripted::Refuse(reason)) => Err(ChannelError::Transport(reason)),
            None => futures::future::pending().await,
        }
    }
}
