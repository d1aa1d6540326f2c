//! Sender against an in-process receiver, with faults injected on the wire.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_protocol::{
    ChannelFuture, Message, MessageType, RequestChannel, RpcError, SendFrameRequest,
    StatusRequest, TransferState,
};
use arbor_receiver::{LocalChannel, ReceiverService, TransferHandler};
use arbor_sender::{EnvelopeRemote, TransferListener, TransferService};
use arbor_transfer::{
    MonotonicIdGenerator, SourceNode, TransferConfig, TransferError, TransferProgress, scan_dir,
};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn config() -> TransferConfig {
    TransferConfig {
        max_frame_size: 64,
        max_frame_blocks: 4,
        request_timeout_ms: 5_000,
        recovery_attempts: 3,
        recovery_delay_ms: 5,
        max_workers: 2,
        progress_interval_ms: 0,
        finished_retention_ms: 60_000,
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// The request never reaches the receiver.
    LoseRequest,
    /// The receiver handles the request but the reply is lost.
    LoseReply,
    /// The first payload byte of a frame is flipped in transit.
    Corrupt,
    /// The request hangs until the caller gives up.
    Stall,
    /// The receiver handles the request; the reply waits for `released`.
    HoldReply,
}

/// Forwards to a [`LocalChannel`], injecting faults into the n-th request
/// of a given type (1-based, resends included).
struct FaultyChannel {
    inner: LocalChannel,
    plan: Vec<(MessageType, usize, Fault)>,
    seen: Mutex<Vec<MessageType>>,
    stalled: Arc<Notify>,
    released: Arc<Notify>,
}

impl FaultyChannel {
    fn new(inner: LocalChannel, plan: Vec<(MessageType, usize, Fault)>) -> Self {
        Self {
            inner,
            plan,
            seen: Mutex::new(Vec::new()),
            stalled: Arc::new(Notify::new()),
            released: Arc::new(Notify::new()),
        }
    }

    fn count(&self, msg_type: MessageType) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|t| **t == msg_type)
            .count()
    }

    fn fault_for(&self, msg_type: MessageType) -> Option<Fault> {
        let mut seen = self.seen.lock().unwrap();
        seen.push(msg_type);
        let n = seen.iter().filter(|t| **t == msg_type).count();
        self.plan
            .iter()
            .find(|(t, at, _)| *t == msg_type && *at == n)
            .map(|(_, _, fault)| *fault)
    }
}

impl RequestChannel for FaultyChannel {
    fn request(&self, msg: Message) -> ChannelFuture<'_> {
        let fault = self.fault_for(msg.msg_type);
        Box::pin(async move {
            match fault {
                None => self.inner.request(msg).await,
                Some(Fault::LoseRequest) => Err(RpcError::Timeout),
                Some(Fault::LoseReply) => {
                    self.inner.request(msg).await?;
                    Err(RpcError::ConnectionLost("reply dropped".into()))
                }
                Some(Fault::Corrupt) => self.inner.request(corrupt(&msg)).await,
                Some(Fault::Stall) => {
                    self.stalled.notify_one();
                    std::future::pending().await
                }
                Some(Fault::HoldReply) => {
                    let reply = self.inner.request(msg).await;
                    self.stalled.notify_one();
                    self.released.notified().await;
                    reply
                }
            }
        })
    }
}

fn corrupt(msg: &Message) -> Message {
    let mut req: SendFrameRequest = msg.parse_payload().unwrap().unwrap();
    if let Some(byte) = req.frame.payload.first_mut() {
        *byte ^= 0xff;
    }
    Message::new(msg.id.clone(), msg.msg_type, Some(&req)).unwrap()
}

/// Records sender callbacks in order.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn terminal(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e != "begin" && e != "progress")
            .collect()
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl TransferListener for Recorder {
    fn on_begin(&self, _transfer_id: &str, _request_id: Option<&str>) {
        self.push("begin");
    }

    fn on_progress(&self, _progress: &TransferProgress) {
        self.push("progress");
    }

    fn on_success(&self, _progress: &TransferProgress) {
        self.push("success");
    }

    fn on_canceled(&self, _progress: &TransferProgress) {
        self.push("canceled");
    }

    fn on_failed(&self, _progress: &TransferProgress, cause: &TransferError) {
        self.push(format!("failed:{cause}"));
    }
}

/// Accepts every transfer into one directory and records outcomes.
struct RecordingHandler {
    root: PathBuf,
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl TransferHandler for RecordingHandler {
    fn on_begin(&self, _transfer_id: &str, _request_id: Option<&str>) -> Result<PathBuf, String> {
        Ok(self.root.clone())
    }

    fn on_success(&self, _transfer_id: &str, _root: &Path) {
        self.events.lock().unwrap().push("success".into());
    }

    fn on_canceled(&self, _transfer_id: &str) {
        self.events.lock().unwrap().push("canceled".into());
    }

    fn on_failed(&self, _transfer_id: &str, cause: &TransferError) {
        self.events.lock().unwrap().push(format!("failed:{cause}"));
    }
}

struct Harness {
    service: TransferService,
    receiver: Arc<ReceiverService>,
    handler: Arc<RecordingHandler>,
    remote: Arc<EnvelopeRemote<FaultyChannel>>,
}

impl Harness {
    fn new(dest: &Path, plan: Vec<(MessageType, usize, Fault)>) -> Self {
        let handler = Arc::new(RecordingHandler::new(dest));
        let receiver = Arc::new(ReceiverService::new(config(), handler.clone()).unwrap());
        let channel = FaultyChannel::new(LocalChannel::new(Arc::clone(&receiver)), plan);
        let remote = Arc::new(EnvelopeRemote::new(channel));
        let service = TransferService::new(config(), remote.clone())
            .unwrap()
            .with_ids(Arc::new(MonotonicIdGenerator::new("xfer")));
        Self {
            service,
            receiver,
            handler,
            remote,
        }
    }

    fn channel(&self) -> &FaultyChannel {
        self.remote.channel()
    }

    fn remote_state(&self, transfer_id: &str) -> Option<TransferState> {
        self.receiver
            .get_status(StatusRequest {
                transfer_id: transfer_id.to_string(),
            })
            .state
    }
}

fn sample_tree() -> Vec<SourceNode> {
    let blob: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    vec![
        SourceNode::dir(
            "docs",
            vec![
                SourceNode::file("readme.txt", b"hello tree".to_vec(), 1_700_000_000_000),
                SourceNode::dir("empty", Vec::new()),
                SourceNode::file("blob.bin", blob, 1_700_000_000_000),
            ],
        ),
        SourceNode::file("top.txt", b"top level".to_vec(), 1_700_000_000_000),
    ]
}

fn assert_sample_tree(dest: &Path) {
    let blob: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(std::fs::read(dest.join("docs/readme.txt")).unwrap(), b"hello tree");
    assert_eq!(std::fs::read(dest.join("docs/blob.bin")).unwrap(), blob);
    assert!(dest.join("docs/empty").is_dir());
    assert_eq!(std::fs::read(dest.join("top.txt")).unwrap(), b"top level");
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scanned_directory_arrives_intact() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("a/b")).unwrap();
    std::fs::write(src.path().join("a/b/deep.txt"), vec![b'x'; 500]).unwrap();
    std::fs::write(src.path().join("a/one.txt"), b"one").unwrap();
    std::fs::write(src.path().join("z.txt"), b"").unwrap();

    let harness = Harness::new(dest.path(), Vec::new());
    let recorder = Arc::new(Recorder::default());
    let roots = scan_dir(src.path()).unwrap();
    let handle = harness
        .service
        .start(roots, Some("req-1".into()), recorder.clone());
    let transfer_id = handle.transfer_id().to_string();
    assert_eq!(transfer_id, "xfer-1");

    let progress = handle.wait().await.unwrap();
    assert_eq!(progress.state, TransferState::Committed);
    assert_eq!(progress.total_bytes, 503);
    assert_eq!(progress.request_id.as_deref(), Some("req-1"));
    assert!(progress.frames > 1);
    assert_eq!(progress.retry_count, 0);
    // Nothing is left to send.
    assert!(progress.eta_ms.is_none_or(|ms| ms == 0));

    assert_eq!(
        std::fs::read(dest.path().join("a/b/deep.txt")).unwrap(),
        vec![b'x'; 500]
    );
    assert_eq!(std::fs::read(dest.path().join("a/one.txt")).unwrap(), b"one");
    assert_eq!(std::fs::read(dest.path().join("z.txt")).unwrap(), b"");

    let events = recorder.events();
    assert_eq!(events.first().map(String::as_str), Some("begin"));
    assert!(events.contains(&"progress".to_string()));
    assert_eq!(recorder.terminal(), vec!["success"]);
    assert_eq!(harness.handler.events(), vec!["success"]);
    assert_eq!(harness.remote_state(&transfer_id), Some(TransferState::Committed));

    // Finished transfers leave the registry.
    assert!(harness.service.status(&transfer_id).is_none());
    assert!(harness.service.active_transfers().is_empty());
}

#[tokio::test]
async fn bounded_pool_runs_every_transfer() {
    let dest = tempfile::tempdir().unwrap();
    let harness = Harness::new(dest.path(), Vec::new());

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let roots = vec![SourceNode::dir(
                format!("batch-{i}"),
                vec![SourceNode::file("data", vec![i as u8; 150], 0)],
            )];
            harness
                .service
                .start(roots, None, Arc::new(arbor_sender::NoopListener))
        })
        .collect();

    for handle in handles {
        handle.wait().await.unwrap();
    }
    for i in 0..4u8 {
        let data = std::fs::read(dest.path().join(format!("batch-{i}/data"))).unwrap();
        assert_eq!(data, vec![i; 150]);
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lost_reply_is_not_resent() {
    let dest = tempfile::tempdir().unwrap();
    let harness = Harness::new(dest.path(), vec![(MessageType::SendFrame, 2, Fault::LoseReply)]);

    let handle = harness
        .service
        .start(sample_tree(), None, Arc::new(Recorder::default()));
    let progress = handle.wait().await.unwrap();

    // The receiver applied the frame; status shows it, so nothing is resent.
    assert_eq!(progress.retry_count, 0);
    assert_eq!(progress.frames as usize, harness.channel().count(MessageType::SendFrame));
    assert_eq!(harness.channel().count(MessageType::GetStatus), 1);
    assert_sample_tree(dest.path());
}

#[tokio::test]
async fn lost_request_is_resent_once() {
    let dest = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        dest.path(),
        vec![
            (MessageType::SendFrame, 3, Fault::LoseRequest),
            (MessageType::Prepare, 1, Fault::LoseRequest),
            (MessageType::Commit, 1, Fault::LoseReply),
        ],
    );

    let handle = harness
        .service
        .start(sample_tree(), None, Arc::new(Recorder::default()));
    let progress = handle.wait().await.unwrap();

    // One resend for the frame and one for prepare; the commit had already
    // taken effect.
    assert_eq!(progress.retry_count, 2);
    assert_eq!(
        harness.channel().count(MessageType::SendFrame),
        progress.frames as usize + 1
    );
    assert_eq!(harness.channel().count(MessageType::Commit), 1);
    assert_sample_tree(dest.path());
    assert_eq!(harness.handler.events(), vec!["success"]);
}

#[tokio::test]
async fn corrupted_payload_fails_both_sides() {
    let dest = tempfile::tempdir().unwrap();
    let harness = Harness::new(dest.path(), vec![(MessageType::SendFrame, 1, Fault::Corrupt)]);
    let recorder = Arc::new(Recorder::default());

    let roots = vec![SourceNode::file("data.bin", vec![7u8; 200], 0)];
    let handle = harness.service.start(roots, None, recorder.clone());
    let transfer_id = handle.transfer_id().to_string();
    let err = handle.wait().await.unwrap_err();

    match err {
        TransferError::Rejected { code, ref message, .. } => {
            assert_eq!(code, 400);
            assert!(message.contains("checksum"), "{message}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    let terminal = recorder.terminal();
    assert_eq!(terminal.len(), 1);
    assert!(terminal[0].starts_with("failed:"));

    let handler_events = harness.handler.events();
    assert_eq!(handler_events.len(), 1);
    assert!(handler_events[0].starts_with("failed:"));
    assert_eq!(harness.remote_state(&transfer_id), Some(TransferState::Failed));
}

#[tokio::test]
async fn refused_transfer_is_not_retried() {
    struct Refusing;
    impl TransferHandler for Refusing {
        fn on_begin(&self, _transfer_id: &str, _request_id: Option<&str>) -> Result<PathBuf, String> {
            Err("disk full".into())
        }
    }

    let receiver = Arc::new(ReceiverService::new(config(), Arc::new(Refusing)).unwrap());
    let remote = Arc::new(EnvelopeRemote::new(LocalChannel::new(receiver)));
    let service = TransferService::new(config(), remote).unwrap();
    let recorder = Arc::new(Recorder::default());

    let handle = service.start(sample_tree(), None, recorder.clone());
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, TransferError::Rejected { code: 409, .. }), "{err:?}");
    assert_eq!(recorder.terminal().len(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_mid_transfer_stops_frames() {
    let dest = tempfile::tempdir().unwrap();
    let harness = Harness::new(dest.path(), vec![(MessageType::SendFrame, 3, Fault::Stall)]);
    let recorder = Arc::new(Recorder::default());

    let handle = harness.service.start(sample_tree(), None, recorder.clone());
    let transfer_id = handle.transfer_id().to_string();

    harness.channel().stalled.notified().await;
    assert_eq!(harness.service.active_transfers(), vec![transfer_id.clone()]);
    let running = harness.service.status(&transfer_id).unwrap();
    assert_eq!(running.state, TransferState::Started);
    assert_eq!(running.frames, 2);

    harness.service.cancel(&transfer_id).await.unwrap();
    let err = handle.wait().await.unwrap_err();
    assert!(err.is_cancellation());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.channel().count(MessageType::SendFrame), 3);
    assert_eq!(harness.channel().count(MessageType::CancelTransfer), 1);
    assert_eq!(recorder.terminal(), vec!["canceled"]);
    assert_eq!(harness.handler.events(), vec!["canceled"]);
    assert_eq!(harness.remote_state(&transfer_id), Some(TransferState::Canceled));
}

#[tokio::test]
async fn cancel_during_commit_keeps_committed_outcome() {
    let dest = tempfile::tempdir().unwrap();
    let harness = Harness::new(dest.path(), vec![(MessageType::Commit, 1, Fault::HoldReply)]);
    let recorder = Arc::new(Recorder::default());

    let handle = harness.service.start(sample_tree(), None, recorder.clone());
    let transfer_id = handle.transfer_id().to_string();

    harness.channel().stalled.notified().await;
    assert_eq!(harness.remote_state(&transfer_id), Some(TransferState::Committed));

    let (cancelled, ()) = tokio::join!(harness.service.cancel(&transfer_id), async {
        harness.channel().released.notify_one();
    });
    assert!(matches!(cancelled, Err(TransferError::AlreadyFinished(_))));

    let progress = handle.wait().await.unwrap();
    assert_eq!(progress.state, TransferState::Committed);
    assert_eq!(recorder.terminal(), vec!["success"]);
    assert_eq!(harness.handler.events(), vec!["success"]);
    assert_eq!(harness.channel().count(MessageType::CancelTransfer), 0);
    assert_sample_tree(dest.path());
}

#[tokio::test]
async fn cancel_finished_transfer_reports_already_finished() {
    let dest = tempfile::tempdir().unwrap();
    let harness = Harness::new(dest.path(), Vec::new());

    let handle = harness
        .service
        .start(sample_tree(), None, Arc::new(Recorder::default()));
    let transfer_id = handle.transfer_id().to_string();
    handle.wait().await.unwrap();

    let err = harness.service.cancel(&transfer_id).await.unwrap_err();
    assert!(matches!(err, TransferError::AlreadyFinished(_)));

    let err = harness.service.cancel("never-started").await.unwrap_err();
    assert!(matches!(err, TransferError::AlreadyFinished(_)));
}

#[tokio::test]
async fn handle_cancel_before_start_never_contacts_receiver() {
    let dest = tempfile::tempdir().unwrap();
    let harness = Harness::new(dest.path(), Vec::new());
    let recorder = Arc::new(Recorder::default());

    let handle = harness.service.start(sample_tree(), None, recorder.clone());
    handle.cancel();
    let err = handle.wait().await.unwrap_err();

    assert!(err.is_cancellation());
    assert_eq!(recorder.events(), vec!["begin", "canceled"]);
    assert_eq!(harness.channel().count(MessageType::SendFrame), 0);
    assert_eq!(harness.channel().count(MessageType::CancelTransfer), 0);
}
