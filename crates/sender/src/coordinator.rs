//! Drives one outgoing transfer through its phases.
//!
//! ```text
//! STARTED ──frames──▶ TRANSFERRED ──prepare──▶ PREPARED ──commit──▶ COMMITTED
//! ```
//!
//! Every protocol step runs under a [`RetryableOperation`]. Cancellation
//! is observed between blocks while frames are built, between frames, and
//! while a step waits on the receiver.

use std::sync::{Arc, Mutex, PoisonError};

use arbor_protocol::{Frame, TransferState};
use arbor_transfer::{
    FrameBuilder, ProgressThrottle, Role, SourceNode, SpeedCalculator, StateMachine,
    TransferConfig, TransferError, TransferProgress, ValidationError, ValidationKind,
};
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::listener::TransferListener;
use crate::remote::RemoteReceiver;
use crate::retry::{RetryPolicy, RetryableOperation, classify_commit, classify_prepare, classify_send};

/// Sender-side owner of one transfer.
pub struct TransferCoordinator {
    transfer_id: String,
    request_id: Option<String>,
    remote: Arc<dyn RemoteReceiver>,
    listener: Arc<dyn TransferListener>,
    config: TransferConfig,
    policy: RetryPolicy,
    cancel: CancellationToken,
    sm: StateMachine,
    state_tx: watch::Sender<TransferState>,
    progress: Arc<Mutex<TransferProgress>>,
    throttle: ProgressThrottle,
    speed: SpeedCalculator,
    /// Set once the receiver may know the transfer.
    contacted: bool,
}

impl TransferCoordinator {
    pub fn new(
        transfer_id: impl Into<String>,
        request_id: Option<String>,
        remote: Arc<dyn RemoteReceiver>,
        listener: Arc<dyn TransferListener>,
        config: &TransferConfig,
    ) -> Self {
        let transfer_id = transfer_id.into();
        let sm = StateMachine::new(Role::Sender);
        let now = Utc::now();
        let progress = TransferProgress {
            transfer_id: transfer_id.clone(),
            request_id: request_id.clone(),
            state: sm.state(),
            bytes_transferred: 0,
            total_bytes: 0,
            frames: 0,
            retry_count: 0,
            started_at: now,
            last_activity: now,
            bytes_per_second: 0.0,
            eta_ms: None,
        };
        Self {
            transfer_id,
            request_id,
            remote,
            listener,
            policy: RetryPolicy::from_config(config),
            config: config.clone(),
            cancel: CancellationToken::new(),
            state_tx: watch::channel(sm.state()).0,
            sm,
            progress: Arc::new(Mutex::new(progress)),
            throttle: ProgressThrottle::new(config.progress_interval()),
            speed: SpeedCalculator::default(),
            contacted: false,
        }
    }

    /// Uses `cancel` as the transfer's cancellation signal.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Lifecycle updates. Terminal states are published only after the
    /// matching listener callback has returned.
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state_tx.subscribe()
    }

    pub fn progress(&self) -> TransferProgress {
        lock(&self.progress).clone()
    }

    pub(crate) fn shared_progress(&self) -> Arc<Mutex<TransferProgress>> {
        Arc::clone(&self.progress)
    }

    /// Runs the transfer to a terminal state.
    pub async fn run(mut self, roots: Vec<SourceNode>) -> Result<TransferProgress, TransferError> {
        info!(transfer = %self.transfer_id, request = ?self.request_id, "transfer started");
        self.listener
            .on_begin(&self.transfer_id, self.request_id.as_deref());

        let result = self.drive(roots).await;
        match result {
            Ok(()) => {
                let progress = self.progress();
                info!(
                    transfer = %self.transfer_id,
                    bytes = progress.bytes_transferred,
                    frames = progress.frames,
                    retries = progress.retry_count,
                    "transfer committed"
                );
                self.listener.on_success(&progress);
                self.publish();
                Ok(progress)
            }
            Err(e) if e.is_cancellation() => {
                self.sm.cancel();
                self.record_state();
                self.notify_remote_cancel().await;
                info!(transfer = %self.transfer_id, "transfer canceled");
                self.listener.on_canceled(&self.progress());
                self.publish();
                Err(e)
            }
            Err(e) => {
                self.sm.fail();
                self.record_state();
                error!(transfer = %self.transfer_id, error = %e, "transfer failed");
                self.listener.on_failed(&self.progress(), &e);
                self.publish();
                Err(e)
            }
        }
    }

    async fn drive(&mut self, roots: Vec<SourceNode>) -> Result<(), TransferError> {
        self.check_cancelled()?;
        self.set_state(TransferState::Started)?;

        let mut builder =
            FrameBuilder::new(roots, &self.config)?.with_cancellation(self.cancel.clone());
        lock(&self.progress).total_bytes = builder.total_bytes();
        debug!(
            transfer = %self.transfer_id,
            files = builder.file_count(),
            total_bytes = builder.total_bytes(),
            "source tree loaded"
        );

        // Data phase.
        let mut last_frame = None;
        loop {
            self.check_cancelled()?;
            let (next, frame) = build_next(builder).await?;
            builder = next;
            let Some(frame) = frame else { break };

            self.check_cancelled()?;
            self.contacted = true;
            let resends = self.send(&frame).await?;
            self.record_frame(&frame, resends);
            last_frame = Some(frame.id);
            if frame.is_last {
                break;
            }
        }
        let Some(last_frame) = last_frame else {
            return Err(ValidationError::new(ValidationKind::EmptyTransfer, "no frames produced").into());
        };
        self.set_state(TransferState::Transferred)?;

        // Prepare phase.
        self.check_cancelled()?;
        let manifest = builder.manifest().to_vec();
        let resends = RetryableOperation::new(
            "prepare",
            &self.transfer_id,
            self.remote.as_ref(),
            self.policy,
            &self.cancel,
        )
        .run(
            || self.remote.prepare(&self.transfer_id, &manifest),
            |status| classify_prepare(last_frame, status),
        )
        .await?;
        self.add_retries(resends);
        self.set_state(TransferState::Prepared)?;
        debug!(transfer = %self.transfer_id, files = manifest.len(), "manifest accepted");

        // Commit phase. Once issued, a commit is seen through to a definite
        // outcome; a cancel arriving meanwhile is too late.
        self.check_cancelled()?;
        let resends = RetryableOperation::new(
            "commit",
            &self.transfer_id,
            self.remote.as_ref(),
            self.policy,
            &self.cancel,
        )
        .ignoring_cancellation()
        .run(|| self.remote.commit(&self.transfer_id), classify_commit)
        .await?;
        self.add_retries(resends);
        self.set_state(TransferState::Committed)?;
        Ok(())
    }

    /// Sends one frame under the recovery protocol. A resend reuses the
    /// retained frame, so the receiver sees identical bytes.
    async fn send(&self, frame: &Frame) -> Result<u32, TransferError> {
        let request_id = self.request_id.as_deref();
        RetryableOperation::new(
            "send_frame",
            &self.transfer_id,
            self.remote.as_ref(),
            self.policy,
            &self.cancel,
        )
        .run(
            || self.remote.send_frame(&self.transfer_id, request_id, frame),
            |status| classify_send(frame.id, status),
        )
        .await
    }

    fn record_frame(&mut self, frame: &Frame, resends: u32) {
        let bytes = frame.size();
        self.speed.add_sample(bytes);
        let snapshot = {
            let mut p = lock(&self.progress);
            p.bytes_transferred += bytes;
            p.frames += 1;
            p.retry_count += resends;
            p.last_activity = Utc::now();
            p.bytes_per_second = self.speed.bytes_per_second();
            p.eta_ms = self
                .speed
                .eta(p.total_bytes.saturating_sub(p.bytes_transferred))
                .and_then(|eta| u64::try_from(eta.as_millis()).ok());
            p.clone()
        };
        debug!(
            transfer = %self.transfer_id,
            frame = %frame.id,
            blocks = frame.blocks.len(),
            bytes,
            resends,
            "frame acknowledged"
        );
        if self.throttle.ready() {
            self.listener.on_progress(&snapshot);
        }
    }

    fn add_retries(&self, resends: u32) {
        let mut p = lock(&self.progress);
        p.retry_count += resends;
        p.last_activity = Utc::now();
    }

    fn set_state(&mut self, next: TransferState) -> Result<(), TransferError> {
        self.sm.transition(next)?;
        self.record_state();
        if !next.is_terminal() {
            self.publish();
        }
        Ok(())
    }

    fn record_state(&self) {
        lock(&self.progress).state = self.sm.state();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.sm.state());
    }

    fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Tells the receiver about the cancellation. Failures are only logged.
    async fn notify_remote_cancel(&self) {
        if !self.contacted {
            return;
        }
        let notice = tokio::time::timeout(
            self.policy.request_timeout,
            self.remote.cancel_transfer(&self.transfer_id),
        )
        .await;
        match notice {
            Ok(Ok(_)) => debug!(transfer = %self.transfer_id, "receiver canceled"),
            Ok(Err(e)) => debug!(transfer = %self.transfer_id, error = %e, "receiver cancel refused"),
            Err(_) => debug!(transfer = %self.transfer_id, "receiver cancel timed out"),
        }
    }
}

/// Builds the next frame on the blocking pool; source reads are file I/O.
async fn build_next(
    mut builder: FrameBuilder,
) -> Result<(FrameBuilder, Option<Frame>), TransferError> {
    tokio::task::spawn_blocking(move || {
        let frame = builder.next_frame()?;
        Ok((builder, frame))
    })
    .await
    .map_err(|e| TransferError::Worker(e.to_string()))?
}

fn lock(progress: &Mutex<TransferProgress>) -> std::sync::MutexGuard<'_, TransferProgress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}
