mod common;

use common::*;
use rapidphoto_client::api::upload::models::{ConnectionStatus, ProgressMessage};
use rapidphoto_client::config::UploadConfig;
use rapidphoto_client::error::ChannelError;
use rapidphoto_client::progress_channel::{
    ChannelHook, MessageHandler, ProgressChannel, ResyncHandler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

fn stream_url() -> Url {
    credentials().stream_url(SESSION_ID).unwrap()
}

fn channel(connector: &Arc<FakeConnector>, config: &UploadConfig) -> ProgressChannel {
    ProgressChannel::new(connector.clone(), stream_url(), "token-1", config)
}

struct Recorder {
    messages: Arc<Mutex<Vec<ProgressMessage>>>,
    resyncs: Arc<AtomicUsize>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            resyncs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn on_message(&self) -> MessageHandler {
        let messages = self.messages.clone();
        Arc::new(move |m| messages.lock().unwrap().push(m))
    }

    fn on_resync(&self) -> Option<ResyncHandler> {
        let resyncs = self.resyncs.clone();
        Some(Arc::new(move || {
            resyncs.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn messages(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn resyncs(&self) -> usize {
        self.resyncs.load(Ordering::SeqCst)
    }
}

#[tokio::test(start_paused = true)]
async fn transient_503_reconnects_and_resyncs_once_per_open() {
    let (feed, stream) = event_stream();
    let connector = FakeConnector::new(vec![respond(503, None), stream]);
    let channel = channel(&connector, &UploadConfig::default());
    let recorder = Recorder::new();

    let task = tokio::spawn({
        let channel = channel.clone();
        let (on_message, on_resync) = (recorder.on_message(), recorder.on_resync());
        async move { channel.connect(on_message, on_resync).await }
    });

    eventually("connected after retry", || channel.is_connected()).await;
    assert_eq!(connector.opens(), 2);
    assert_eq!(recorder.resyncs(), 1);

    feed.photo_uploaded("p1", 1, 3);
    eventually("first message", || recorder.messages() == 1).await;

    let (feed2, stream2) = event_stream();
    connector.push(stream2);
    feed.fail("connection reset");
    eventually("second open", || connector.opens() == 3 && channel.is_connected()).await;
    assert_eq!(recorder.resyncs(), 2);

    feed2.photo_uploaded("p2", 2, 3);
    eventually("second message", || recorder.messages() == 2).await;

    channel.disconnect();
    channel.disconnect();
    assert_eq!(within(task).await.unwrap(), Ok(()));
    assert_eq!(channel.connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn client_error_is_fatal_and_never_resyncs() {
    let connector = FakeConnector::new(vec![respond(404, Some("application/json"))]);
    let channel = channel(&connector, &UploadConfig::default());
    let recorder = Recorder::new();

    let result = within(channel.connect(recorder.on_message(), recorder.on_resync())).await;
    assert_eq!(result, Err(ChannelError::Rejected { status: 404 }));
    assert_eq!(recorder.resyncs(), 0);
    assert_eq!(connector.opens(), 1);
    assert_eq!(channel.connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn wrong_content_type_means_session_ended() {
    let connector = FakeConnector::new(vec![respond(200, Some("application/json"))]);
    let channel = channel(&connector, &UploadConfig::default());
    let recorder = Recorder::new();

    let result = within(channel.connect(recorder.on_message(), recorder.on_resync())).await;
    assert!(matches!(
        result,
        Err(ChannelError::SessionEnded { status: 200, .. })
    ));
    assert_eq!(recorder.resyncs(), 0);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let connector = FakeConnector::new(vec![
        respond(503, None),
        respond(429, None),
        Scripted::Refuse("dns failure".into()),
    ]);
    let config = UploadConfig {
        max_reconnect_attempts: 3,
        ..UploadConfig::default()
    };
    let channel = channel(&connector, &config);
    let recorder = Recorder::new();

    let result = within(channel.connect(recorder.on_message(), recorder.on_resync())).await;
    assert_eq!(result, Err(ChannelError::RetriesExhausted { attempts: 3 }));
    assert_eq!(connector.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn unknown_and_malformed_events_are_dropped() {
    let (feed, stream) = event_stream();
    let connector = FakeConnector::new(vec![stream]);
    let channel = channel(&connector, &UploadConfig::default());
    let recorder = Recorder::new();

    let task = tokio::spawn({
        let channel = channel.clone();
        let on_message = recorder.on_message();
        async move { channel.connect(on_message, None).await }
    });
    eventually("connected", || channel.is_connected()).await;

    feed.raw(": heartbeat\n\n");
    feed.event("notification", r#"{"hello":"world"}"#);
    feed.event("PHOTO_FAILED", "{not json");
    feed.session_completed(3, 0, 3);
    eventually("valid message", || recorder.messages() == 1).await;

    assert!(channel.is_connected());
    assert!(matches!(
        recorder.messages.lock().unwrap()[0],
        ProgressMessage::SessionCompleted(_)
    ));
    channel.disconnect();
    assert_eq!(within(task).await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn status_changes_reach_every_subscriber_in_order() {
    let (_feed, stream) = event_stream();
    let connector = FakeConnector::new(vec![stream]);
    let channel = channel(&connector, &UploadConfig::default());

    let log = Arc::new(Mutex::new(Vec::new()));
    let _first = channel.on_connection_status_change({
        let log = log.clone();
        move |s| log.lock().unwrap().push((1, s))
    });
    let second = channel.on_connection_status_change({
        let log = log.clone();
        move |s| log.lock().unwrap().push((2, s))
    });

    let task = tokio::spawn({
        let channel = channel.clone();
        let recorder = Recorder::new();
        async move { channel.connect(recorder.on_message(), None).await }
    });
    eventually("connected", || channel.is_connected()).await;
    second.unsubscribe();
    channel.disconnect();
    within(task).await.unwrap().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (1, ConnectionStatus::Connecting),
            (2, ConnectionStatus::Connecting),
            (1, ConnectionStatus::Connected),
            (2, ConnectionStatus::Connected),
            (1, ConnectionStatus::Disconnected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_uses_new_token_and_last_event_id() {
    let (feed, stream) = event_stream();
    let connector = FakeConnector::new(vec![stream]);
    let channel = channel(&connector, &UploadConfig::default());
    let recorder = Recorder::new();

    let task = tokio::spawn({
        let channel = channel.clone();
        let on_message = recorder.on_message();
        async move { channel.connect(on_message, None).await }
    });
    eventually("connected", || channel.is_connected()).await;

    feed.raw("id: 41\n");
    feed.photo_uploaded("p1", 1, 2);
    eventually("message", || recorder.messages() == 1).await;

    channel.update_auth_token("token-2");
    assert!(channel.is_connected());
    let (_feed2, stream2) = event_stream();
    connector.push(stream2);
    feed.fail("reset");
    eventually("reconnected", || connector.opens() == 2 && channel.is_connected()).await;

    assert_eq!(
        *connector.tokens.lock().unwrap(),
        vec!["token-1".to_string(), "token-2".to_string()]
    );
    assert_eq!(
        *connector.last_event_ids.lock().unwrap(),
        vec![None, Some("41".to_string())]
    );
    channel.disconnect();
    within(task).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn hook_needs_complete_binding() {
    let connector = FakeConnector::new(vec![]);
    let mut hook = ChannelHook::new(connector.clone(), UploadConfig::default());
    let recorder = Recorder::new();

    hook.bind(stream_url().as_str(), None, true);
    assert!(hook.channel().is_none());
    hook.subscribe(recorder.on_message());
    hook.bind("", Some("token-1"), true);
    assert!(hook.channel().is_none());
    hook.bind(stream_url().as_str(), Some("token-1"), false);
    assert!(hook.channel().is_none());
    assert_eq!(hook.connection_status(), ConnectionStatus::Disconnected);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(connector.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn hook_rebinds_only_when_the_triple_changes() {
    let (_feed, stream) = event_stream();
    let (_feed2, stream2) = event_stream();
    let connector = FakeConnector::new(vec![stream, stream2]);
    let mut hook = ChannelHook::new(connector.clone(), UploadConfig::default());
    let mut status = hook.status_receiver();
    let recorder = Recorder::new();

    hook.bind(stream_url().as_str(), Some("token-1"), true);
    hook.subscribe(recorder.on_message());
    eventually("connected", || hook.is_connected()).await;
    let first = hook.channel().unwrap().clone();
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Connected);

    hook.bind(stream_url().as_str(), Some("token-1"), true);
    assert!(first.is_connected());

    hook.bind(stream_url().as_str(), Some("token-2"), true);
    assert!(!first.is_connected());
    assert_eq!(hook.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Disconnected);

    hook.subscribe(recorder.on_message());
    eventually("second channel connected", || hook.is_connected()).await;
    assert_eq!(connector.opens(), 2);

    drop(hook);
    assert!(!first.is_connected());
}

#[tokio::test(start_paused = true)]
async fn hook_reconnect_reuses_last_handler() {
    let (feed, stream) = event_stream();
    let connector = FakeConnector::new(vec![stream]);
    let mut hook = ChannelHook::new(connector.clone(), UploadConfig::default());
    let recorder = Recorder::new();

    hook.bind(stream_url().as_str(), Some("token-1"), true);
    hook.subscribe(recorder.on_message());
    eventually("connected", || hook.is_connected()).await;

    hook.unsubscribe();
    assert!(!hook.is_connected());
    feed.photo_uploaded("p1", 1, 1);

    let (feed2, stream2) = event_stream();
    connector.push(stream2);
    hook.reconnect();
    // 取消订阅后忘记了处理函数，reconnect 不会建连。
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(connector.opens(), 1);

    hook.subscribe(recorder.on_message());
    eventually("second open", || hook.is_connected()).await;
    hook.reconnect();
    eventually("reconnected", || connector.opens() == 3).await;
    feed2.photo_uploaded("p2", 1, 1);
    assert_eq!(recorder.messages(), 0);
}

#[tokio::test(start_paused = true)]
async fn unbind_right_after_subscribe_never_opens_a_stream() {
    let (_feed, stream) = event_stream();
    let connector = FakeConnector::new(vec![stream]);
    let mut hook = ChannelHook::new(connector.clone(), UploadConfig::default());
    let recorder = Recorder::new();

    hook.bind(stream_url().as_str(), Some("token-1"), true);
    let channel = hook.channel().unwrap().clone();
    hook.subscribe(recorder.on_message());
    hook.unbind();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(connector.opens(), 0);
    assert_eq!(channel.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(hook.connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_before_first_poll_cancels_the_connect() {
    let (_feed, stream) = event_stream();
    let connector = FakeConnector::new(vec![stream]);
    let channel = channel(&connector, &UploadConfig::default());
    let recorder = Recorder::new();

    let connecting = channel.connect(recorder.on_message(), recorder.on_resync());
    channel.disconnect();

    assert_eq!(within(connecting).await, Ok(()));
    assert_eq!(connector.opens(), 0);
    assert_eq!(recorder.resyncs(), 0);
    assert_eq!(channel.connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_from_a_status_handler_keeps_every_subscriber_in_order() {
    let (_feed, stream) = event_stream();
    let connector = FakeConnector::new(vec![stream]);
    let channel = channel(&connector, &UploadConfig::default());

    let log = Arc::new(Mutex::new(Vec::new()));
    let _first = channel.on_connection_status_change({
        let log = log.clone();
        let channel = channel.clone();
        move |s| {
            log.lock().unwrap().push((1, s));
            if s == ConnectionStatus::Connected {
                channel.disconnect();
            }
        }
    });
    let _second = channel.on_connection_status_change({
        let log = log.clone();
        move |s| log.lock().unwrap().push((2, s))
    });

    let recorder = Recorder::new();
    let result = within(channel.connect(recorder.on_message(), None)).await;
    assert_eq!(result, Ok(()));

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (1, ConnectionStatus::Connecting),
            (2, ConnectionStatus::Connecting),
            (1, ConnectionStatus::Connected),
            (2, ConnectionStatus::Connected),
            (1, ConnectionStatus::Disconnected),
            (2, ConnectionStatus::Disconnected),
        ]
    );
    assert_eq!(channel.connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disconnect_leaves_handlers_on_the_final_status() {
    for _ in 0..50 {
        let (_feed, stream) = event_stream();
        let connector = FakeConnector::new(vec![stream]);
        let channel = channel(&connector, &UploadConfig::default());
        let last = Arc::new(Mutex::new(ConnectionStatus::Disconnected));
        let _sub = channel.on_connection_status_change({
            let last = last.clone();
            move |s| *last.lock().unwrap() = s
        });

        let task = tokio::spawn(channel.connect(Recorder::new().on_message(), None));
        tokio::task::yield_now().await;
        channel.disconnect();
        within(task).await.unwrap().unwrap();

        assert_eq!(channel.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(*last.lock().unwrap(), channel.connection_status());
    }
}
