//! Per-transfer receiving worker.
//!
//! Each accepted transfer gets one tokio task that exclusively owns its
//! [`ReceiveState`]. Protocol operations reach it as commands over an mpsc
//! channel and wait on a oneshot reply, so frames of one transfer are
//! applied strictly one at a time. The worker publishes its lifecycle state
//! through a `watch` channel and its counters through a shared mutex; both
//! are readable without going through the worker.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use arbor_protocol::{Frame, FrameId, ManifestEntry, RemoteStatus, TransferState};
use arbor_transfer::{
    FrameAssembler, ProgressThrottle, ReceiveState, Role, SpeedCalculator, StateMachine,
    TransferConfig, TransferError, TransferProgress, ValidationError,
};
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ReceiverError;
use crate::handler::TransferHandler;

type Reply = oneshot::Sender<Result<RemoteStatus, TransferError>>;

enum Command {
    Frame { frame: Frame, reply: Reply },
    Prepare { manifest: Vec<ManifestEntry>, reply: Reply },
    Commit { reply: Reply },
}

impl Command {
    fn into_reply(self) -> Reply {
        match self {
            Command::Frame { reply, .. }
            | Command::Prepare { reply, .. }
            | Command::Commit { reply } => reply,
        }
    }
}

/// Counters shared between the worker and status readers.
#[derive(Debug, Clone)]
struct Activity {
    last_received: Option<FrameId>,
    bytes: u64,
    frames: u64,
    duplicates: u32,
    bytes_per_second: f64,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Handle to one incoming transfer.
pub struct TransferContext {
    transfer_id: String,
    request_id: Option<String>,
    root: PathBuf,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<TransferState>,
    activity: Arc<Mutex<Activity>>,
    cancel: CancellationToken,
}

impl TransferContext {
    /// Creates the transfer root and spawns the worker.
    ///
    /// The worker holds `permit` for its whole lifetime.
    pub(crate) async fn start(
        transfer_id: String,
        request_id: Option<String>,
        root: PathBuf,
        handler: Arc<dyn TransferHandler>,
        config: &TransferConfig,
        permit: OwnedSemaphorePermit,
    ) -> Result<Self, ReceiverError> {
        let receive = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || ReceiveState::new(root))
                .await
                .map_err(|_| ReceiverError::WorkerGone)??
        };

        let mut sm = StateMachine::new(Role::Receiver);
        sm.transition(TransferState::Started)?;
        let (state_tx, state_rx) = watch::channel(sm.state());
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let now = Utc::now();
        let activity = Arc::new(Mutex::new(Activity {
            last_received: None,
            bytes: 0,
            frames: 0,
            duplicates: 0,
            bytes_per_second: 0.0,
            started_at: now,
            last_activity: now,
        }));
        let cancel = CancellationToken::new();

        let worker = Worker {
            transfer_id: transfer_id.clone(),
            request_id: request_id.clone(),
            root: root.clone(),
            sm,
            state_tx,
            receive: Some(receive),
            assembler: FrameAssembler::new(config.max_frame_size, config.max_frame_blocks),
            data_complete: false,
            activity: Arc::clone(&activity),
            handler,
            cancel: cancel.clone(),
            throttle: ProgressThrottle::new(config.progress_interval()),
            speed: SpeedCalculator::default(),
            commands: cmd_rx,
            _permit: permit,
        };
        info!(transfer = %transfer_id, root = %root.display(), "receiving transfer");
        tokio::spawn(worker.run());

        Ok(Self {
            transfer_id,
            request_id,
            root,
            commands: cmd_tx,
            state: state_rx,
            activity,
            cancel,
        })
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.clone()
    }

    /// Status as reported to the sender's recovery protocol.
    pub fn status(&self) -> RemoteStatus {
        let last = self.activity().last_received;
        RemoteStatus {
            transfer_id: self.transfer_id.clone(),
            state: Some(self.state()),
            last_received_frame_id: last,
        }
    }

    pub fn progress(&self) -> TransferProgress {
        snapshot(
            &self.transfer_id,
            self.request_id.as_deref(),
            self.state(),
            &self.activity(),
        )
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<RemoteStatus, ReceiverError> {
        let status = self.status();
        if status.last_received_frame_id == Some(frame.id) && self.state().is_past_data_phase() {
            // Late resend of the final frame after the transfer moved on.
            return Ok(status);
        }
        self.request(|reply| Command::Frame { frame, reply }).await
    }

    pub async fn prepare(&self, manifest: Vec<ManifestEntry>) -> Result<RemoteStatus, ReceiverError> {
        if self.state() == TransferState::Committed {
            return Ok(self.status());
        }
        self.request(|reply| Command::Prepare { manifest, reply }).await
    }

    pub async fn commit(&self) -> Result<RemoteStatus, ReceiverError> {
        if self.state() == TransferState::Committed {
            return Ok(self.status());
        }
        self.request(|reply| Command::Commit { reply }).await
    }

    /// Cancels the transfer and waits until the worker has stopped.
    pub async fn cancel(&self) -> Result<RemoteStatus, ReceiverError> {
        if self.is_finished() {
            return Err(self.finished_error());
        }
        self.cancel.cancel();
        let mut state = self.state.clone();
        state
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| ReceiverError::WorkerGone)?;
        Ok(self.status())
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply) -> Command,
    ) -> Result<RemoteStatus, ReceiverError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_err() {
            return Err(self.finished_error());
        }
        match rx.await {
            Ok(result) => result.map_err(ReceiverError::from),
            Err(_) => Err(self.finished_error()),
        }
    }

    fn finished_error(&self) -> ReceiverError {
        TransferError::AlreadyFinished(format!("transfer is {}", self.state())).into()
    }

    fn activity(&self) -> Activity {
        self.activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn snapshot(
    transfer_id: &str,
    request_id: Option<&str>,
    state: TransferState,
    activity: &Activity,
) -> TransferProgress {
    TransferProgress {
        transfer_id: transfer_id.to_string(),
        request_id: request_id.map(str::to_string),
        state,
        bytes_transferred: activity.bytes,
        // The receiver learns the tree size only as files arrive.
        total_bytes: 0,
        frames: activity.frames,
        retry_count: activity.duplicates,
        started_at: activity.started_at,
        last_activity: activity.last_activity,
        bytes_per_second: activity.bytes_per_second,
        eta_ms: None,
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    transfer_id: String,
    request_id: Option<String>,
    root: PathBuf,
    sm: StateMachine,
    state_tx: watch::Sender<TransferState>,
    /// Taken while a frame is applied on the blocking pool.
    receive: Option<ReceiveState>,
    assembler: FrameAssembler,
    data_complete: bool,
    activity: Arc<Mutex<Activity>>,
    handler: Arc<dyn TransferHandler>,
    cancel: CancellationToken,
    throttle: ProgressThrottle,
    speed: SpeedCalculator,
    commands: mpsc::Receiver<Command>,
    _permit: OwnedSemaphorePermit,
}

impl Worker {
    async fn run(mut self) {
        while !self.sm.is_terminal() {
            let cmd = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                cmd = self.commands.recv() => cmd,
            };
            match cmd {
                Some(cmd) => self.handle(cmd).await,
                None => self.abort(&TransferError::Cancelled),
            }
        }

        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            let _ = cmd.into_reply().send(Err(TransferError::AlreadyFinished(format!(
                "transfer is {}",
                self.sm.state()
            ))));
        }
        debug!(transfer = %self.transfer_id, state = %self.sm.state(), "receive worker stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        let (result, reply) = match cmd {
            Command::Frame { frame, reply } => (self.on_frame(frame).await, reply),
            Command::Prepare { manifest, reply } => (self.on_prepare(&manifest), reply),
            Command::Commit { reply } => (self.on_commit(), reply),
        };
        if let Err(e) = &result {
            self.abort(e);
        }
        let _ = reply.send(result);
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<RemoteStatus, TransferError> {
        self.sm.ensure_active()?;
        let last = self.lock_activity().last_received;

        if last == Some(frame.id) {
            debug!(transfer = %self.transfer_id, frame = %frame.id, "duplicate frame acknowledged");
            self.lock_activity().duplicates += 1;
            return Ok(self.status());
        }
        if self.sm.state() != TransferState::Started {
            return Err(ValidationError::sequence("frame received after the data phase")
                .with("frame", frame.id)
                .into());
        }
        let expected = last.map_or(FrameId::FIRST, FrameId::next);
        if frame.id != expected {
            return Err(ValidationError::sequence("frame out of order")
                .with("expected", expected)
                .with("received", frame.id)
                .into());
        }

        let Some(mut receive) = self.receive.take() else {
            return Err(TransferError::AlreadyFinished("receive state released".into()));
        };
        let id = frame.id;
        let is_last = frame.is_last;
        let assembler = self.assembler;
        let cancel = self.cancel.clone();
        let (receive, applied) = tokio::task::spawn_blocking(move || {
            let applied = assembler.apply(&mut receive, &frame, &cancel);
            (receive, applied)
        })
        .await
        .map_err(|e| TransferError::Worker(e.to_string()))?;
        self.receive = Some(receive);
        let written = applied?;

        self.speed.add_sample(written);
        {
            let mut activity = self.lock_activity();
            activity.last_received = Some(id);
            activity.bytes += written;
            activity.frames += 1;
            activity.last_activity = Utc::now();
            activity.bytes_per_second = self.speed.bytes_per_second();
        }
        self.data_complete = is_last;
        debug!(transfer = %self.transfer_id, frame = %id, bytes = written, is_last, "frame applied");

        if self.throttle.ready() {
            let progress = snapshot(
                &self.transfer_id,
                self.request_id.as_deref(),
                self.sm.state(),
                &self.lock_activity(),
            );
            self.handler.on_progress(&progress);
        }
        Ok(self.status())
    }

    fn on_prepare(&mut self, manifest: &[ManifestEntry]) -> Result<RemoteStatus, TransferError> {
        self.sm.ensure_active()?;
        if self.sm.state() == TransferState::Prepared {
            return Ok(self.status());
        }
        if !self.data_complete {
            return Err(ValidationError::sequence("prepare before the last frame").into());
        }
        let Some(receive) = self.receive.as_ref() else {
            return Err(TransferError::AlreadyFinished("receive state released".into()));
        };
        if !receive.is_at_rest() {
            return Err(ValidationError::sequence("tree left open at prepare")
                .with("depth", receive.depth())
                .with("open_file", receive.has_open_file())
                .into());
        }
        receive.verify_manifest(manifest)?;

        self.set_state(TransferState::Prepared)?;
        info!(transfer = %self.transfer_id, files = manifest.len(), "transfer prepared");
        Ok(self.status())
    }

    fn on_commit(&mut self) -> Result<RemoteStatus, TransferError> {
        self.sm.ensure_active()?;
        self.sm.transition(TransferState::Committed)?;
        self.receive = None;
        info!(transfer = %self.transfer_id, "transfer committed");
        self.handler.on_success(&self.transfer_id, &self.root);
        self.publish();
        Ok(self.status())
    }

    /// Moves to `Failed` or `Canceled` for fatal errors and notifies the
    /// handler before the new state becomes visible. Conflicting requests
    /// leave the transfer untouched.
    fn abort(&mut self, cause: &TransferError) {
        match cause {
            TransferError::AlreadyFinished(_) | TransferError::InvalidTransition { .. } => {
                warn!(transfer = %self.transfer_id, error = %cause, "request refused");
            }
            TransferError::Cancelled => {
                if self.sm.cancel() {
                    info!(transfer = %self.transfer_id, "transfer canceled");
                    self.handler.on_canceled(&self.transfer_id);
                    self.publish();
                }
            }
            _ => {
                if self.sm.fail() {
                    error!(transfer = %self.transfer_id, error = %cause, "transfer failed");
                    self.handler.on_failed(&self.transfer_id, cause);
                    self.publish();
                }
            }
        }
    }

    fn set_state(&mut self, next: TransferState) -> Result<(), TransferError> {
        self.sm.transition(next)?;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.sm.state());
    }

    fn status(&self) -> RemoteStatus {
        RemoteStatus {
            transfer_id: self.transfer_id.clone(),
            state: Some(self.sm.state()),
            last_received_frame_id: self.lock_activity().last_received,
        }
    }

    fn lock_activity(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
