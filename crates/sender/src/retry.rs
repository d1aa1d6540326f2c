//! Recovery protocol for one protocol step.
//!
//! A communication fault leaves the outcome of a request unknown. Instead
//! of guessing, [`RetryableOperation`] asks the receiver for its status and
//! lets a per-operation classifier decide whether the step already took
//! effect, should be resent unchanged, or can no longer be reconciled.

use std::future::Future;
use std::time::Duration;

use arbor_protocol::constants::CODE_INTERNAL;
use arbor_protocol::{FrameId, RemoteStatus, RpcError, TransferState};
use arbor_transfer::{TransferConfig, TransferError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::remote::RemoteReceiver;

/// Timeouts and recovery budget for protocol steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub request_timeout: Duration,
    /// Status queries allowed per step, shared across resends.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            attempts: config.recovery_attempts,
            delay: config.recovery_delay(),
        }
    }
}

/// What the receiver's status says about an interrupted step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// The step took effect; continue as if it had succeeded.
    Completed,
    /// The step did not take effect; send it again unchanged.
    Resend,
    /// The receiver is in a state no local attempt explains.
    Desynchronized(String),
}

/// Classifies the status after an interrupted `send_frame` of `frame`.
pub fn classify_send(frame: FrameId, status: &RemoteStatus) -> Recovery {
    match status.state {
        Some(TransferState::Prepared | TransferState::Committed) => return Recovery::Completed,
        Some(state @ (TransferState::Failed | TransferState::Canceled)) => {
            return Recovery::Desynchronized(format!("remote transfer is {state}"));
        }
        _ => {}
    }
    match status.last_received_frame_id {
        Some(last) if last == frame => Recovery::Completed,
        last if last == frame.prev() => Recovery::Resend,
        Some(last) => Recovery::Desynchronized(format!(
            "sent frame {frame}, remote last received frame {last}"
        )),
        None => Recovery::Desynchronized(format!("sent frame {frame}, remote received none")),
    }
}

/// Classifies the status after an interrupted `prepare` whose data phase
/// ended with `last_frame`.
pub fn classify_prepare(last_frame: FrameId, status: &RemoteStatus) -> Recovery {
    match status.state {
        Some(TransferState::Prepared | TransferState::Committed) => Recovery::Completed,
        Some(TransferState::Started) if status.last_received_frame_id == Some(last_frame) => {
            Recovery::Resend
        }
        other => Recovery::Desynchronized(describe(other, "prepare")),
    }
}

/// Classifies the status after an interrupted `commit`.
pub fn classify_commit(status: &RemoteStatus) -> Recovery {
    match status.state {
        Some(TransferState::Committed) => Recovery::Completed,
        Some(TransferState::Prepared) => Recovery::Resend,
        other => Recovery::Desynchronized(describe(other, "commit")),
    }
}

fn describe(state: Option<TransferState>, operation: &str) -> String {
    match state {
        Some(state) => format!("remote transfer is {state} during {operation}"),
        None => format!("remote does not know the transfer during {operation}"),
    }
}

/// Runs one protocol step under the recovery protocol.
pub struct RetryableOperation<'a> {
    operation: &'static str,
    transfer_id: &'a str,
    remote: &'a dyn RemoteReceiver,
    policy: RetryPolicy,
    cancel: &'a CancellationToken,
    interruptible: bool,
}

impl<'a> RetryableOperation<'a> {
    pub fn new(
        operation: &'static str,
        transfer_id: &'a str,
        remote: &'a dyn RemoteReceiver,
        policy: RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            operation,
            transfer_id,
            remote,
            policy,
            cancel,
            interruptible: true,
        }
    }

    /// Runs the step to a definite outcome even if the transfer is
    /// cancelled meanwhile. Timeouts and the attempt budget still apply.
    pub fn ignoring_cancellation(mut self) -> Self {
        self.interruptible = false;
        self
    }

    /// Runs `op` until it succeeds or fails fatally, returning the number
    /// of resends it took.
    ///
    /// Rejections are fatal at once. Timeouts and connection faults start
    /// recovery: after `policy.delay` the receiver's status is queried and
    /// passed to `classify`. Failed status queries consume the same attempt
    /// budget; exhausting it is a communication failure.
    pub async fn run<F, Fut, C>(&self, mut op: F, classify: C) -> Result<u32, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RemoteStatus, RpcError>>,
        C: Fn(&RemoteStatus) -> Recovery,
    {
        let mut resends = 0;
        let mut attempts = 0;

        'send: loop {
            match self.call(op()).await? {
                Ok(_) => return Ok(resends),
                Err(e) if !e.is_retriable() => return Err(self.rejected(e)),
                Err(e) => warn!(
                    transfer = %self.transfer_id,
                    operation = self.operation,
                    error = %e,
                    "communication fault, recovering"
                ),
            }

            loop {
                if attempts == self.policy.attempts {
                    return Err(TransferError::Communication {
                        operation: self.operation,
                        attempts,
                    });
                }
                attempts += 1;
                self.pause().await?;

                let status = match self.call(self.remote.get_status(self.transfer_id)).await? {
                    Ok(status) => status,
                    Err(e) if e.is_retriable() => {
                        warn!(
                            transfer = %self.transfer_id,
                            operation = self.operation,
                            attempt = attempts,
                            error = %e,
                            "status query failed"
                        );
                        continue;
                    }
                    Err(e) => return Err(self.rejected(e)),
                };

                match classify(&status) {
                    Recovery::Completed => {
                        info!(
                            transfer = %self.transfer_id,
                            operation = self.operation,
                            attempt = attempts,
                            "remote already applied the step"
                        );
                        return Ok(resends);
                    }
                    Recovery::Resend => {
                        info!(
                            transfer = %self.transfer_id,
                            operation = self.operation,
                            attempt = attempts,
                            "resending"
                        );
                        resends += 1;
                        continue 'send;
                    }
                    Recovery::Desynchronized(detail) => {
                        return Err(TransferError::Desynchronized {
                            operation: self.operation,
                            detail,
                        });
                    }
                }
            }
        }
    }

    /// Awaits one request under the timeout. An interruptible step
    /// abandons it on cancellation.
    async fn call<Fut>(&self, fut: Fut) -> Result<Result<RemoteStatus, RpcError>, TransferError>
    where
        Fut: Future<Output = Result<RemoteStatus, RpcError>>,
    {
        let timed = async {
            tokio::time::timeout(self.policy.request_timeout, fut)
                .await
                .unwrap_or(Err(RpcError::Timeout))
        };
        if !self.interruptible {
            return Ok(timed.await);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            r = timed => Ok(r),
        }
    }

    async fn pause(&self) -> Result<(), TransferError> {
        if !self.interruptible {
            tokio::time::sleep(self.policy.delay).await;
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(self.policy.delay) => Ok(()),
        }
    }

    fn rejected(&self, e: RpcError) -> TransferError {
        let (code, message) = match e {
            RpcError::Rejected { code, message } => (code, message),
            other => (CODE_INTERNAL, other.to_string()),
        };
        TransferError::Rejected {
            operation: self.operation,
            code,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteFuture;
    use arbor_protocol::{Frame, ManifestEntry};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn status(state: Option<TransferState>, last: Option<u64>) -> RemoteStatus {
        RemoteStatus {
            transfer_id: "t".into(),
            state,
            last_received_frame_id: last.map(FrameId),
        }
    }

    #[test]
    fn send_classification() {
        use TransferState::*;
        let f3 = FrameId(3);
        assert_eq!(classify_send(f3, &status(Some(Started), Some(3))), Recovery::Completed);
        assert_eq!(classify_send(f3, &status(Some(Started), Some(2))), Recovery::Resend);
        assert!(matches!(
            classify_send(f3, &status(Some(Started), Some(1))),
            Recovery::Desynchronized(_)
        ));
        assert!(matches!(
            classify_send(f3, &status(None, None)),
            Recovery::Desynchronized(_)
        ));
        assert_eq!(classify_send(f3, &status(Some(Prepared), Some(3))), Recovery::Completed);
        assert!(matches!(
            classify_send(f3, &status(Some(Failed), Some(2))),
            Recovery::Desynchronized(_)
        ));

        // The first frame may be lost before the receiver knows the transfer.
        assert_eq!(classify_send(FrameId(0), &status(None, None)), Recovery::Resend);
        assert_eq!(
            classify_send(FrameId(0), &status(Some(Started), Some(0))),
            Recovery::Completed
        );
    }

    #[test]
    fn prepare_and_commit_classification() {
        use TransferState::*;
        let last = FrameId(7);
        assert_eq!(classify_prepare(last, &status(Some(Prepared), Some(7))), Recovery::Completed);
        assert_eq!(classify_prepare(last, &status(Some(Committed), Some(7))), Recovery::Completed);
        assert_eq!(classify_prepare(last, &status(Some(Started), Some(7))), Recovery::Resend);
        assert!(matches!(
            classify_prepare(last, &status(Some(Started), Some(6))),
            Recovery::Desynchronized(_)
        ));
        assert!(matches!(
            classify_prepare(last, &status(Some(Failed), Some(7))),
            Recovery::Desynchronized(_)
        ));

        assert_eq!(classify_commit(&status(Some(Committed), None)), Recovery::Completed);
        assert_eq!(classify_commit(&status(Some(Prepared), None)), Recovery::Resend);
        assert!(matches!(
            classify_commit(&status(None, None)),
            Recovery::Desynchronized(_)
        ));
    }

    /// Remote whose status replies follow a script; every status query
    /// pops the next entry (`None` = connection fault).
    struct StatusScript {
        statuses: Mutex<Vec<Option<RemoteStatus>>>,
        queries: AtomicU32,
    }

    impl StatusScript {
        fn new(statuses: Vec<Option<RemoteStatus>>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                queries: AtomicU32::new(0),
            }
        }
    }

    impl RemoteReceiver for StatusScript {
        fn send_frame<'a>(&'a self, _: &'a str, _: Option<&'a str>, _: &'a Frame) -> RemoteFuture<'a> {
            unreachable!()
        }
        fn prepare<'a>(&'a self, _: &'a str, _: &'a [ManifestEntry]) -> RemoteFuture<'a> {
            unreachable!()
        }
        fn commit<'a>(&'a self, _: &'a str) -> RemoteFuture<'a> {
            unreachable!()
        }
        fn get_status<'a>(&'a self, _: &'a str) -> RemoteFuture<'a> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let next = self.statuses.lock().unwrap().remove(0);
            Box::pin(async move { next.ok_or_else(|| RpcError::ConnectionLost("reset".into())) })
        }
        fn cancel_transfer<'a>(&'a self, _: &'a str) -> RemoteFuture<'a> {
            unreachable!()
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            request_timeout: Duration::from_secs(5),
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }

    /// Step whose results follow a script (`Err` entries are faults).
    fn scripted(results: Vec<Result<(), RpcError>>) -> (Mutex<Vec<Result<(), RpcError>>>, AtomicU32) {
        (Mutex::new(results), AtomicU32::new(0))
    }

    async fn step(
        script: &(Mutex<Vec<Result<(), RpcError>>>, AtomicU32),
    ) -> Result<RemoteStatus, RpcError> {
        script.1.fetch_add(1, Ordering::SeqCst);
        let next = script.0.lock().unwrap().remove(0);
        next.map(|_| status(Some(TransferState::Started), Some(0)))
    }

    #[tokio::test(start_paused = true)]
    async fn success_needs_no_recovery() {
        let remote = StatusScript::new(vec![]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("send_frame", "t", &remote, policy(), &cancel);
        let script = scripted(vec![Ok(())]);

        let resends = op
            .run(|| step(&script), |s| classify_send(FrameId(0), s))
            .await
            .unwrap();
        assert_eq!(resends, 0);
        assert_eq!(remote.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_then_completed_does_not_resend() {
        let remote = StatusScript::new(vec![Some(status(Some(TransferState::Started), Some(4)))]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("send_frame", "t", &remote, policy(), &cancel);
        let script = scripted(vec![Err(RpcError::Timeout)]);

        let resends = op
            .run(|| step(&script), |s| classify_send(FrameId(4), s))
            .await
            .unwrap();
        assert_eq!(resends, 0);
        assert_eq!(script.1.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_then_pending_resends() {
        let remote = StatusScript::new(vec![
            None,
            Some(status(Some(TransferState::Started), Some(3))),
        ]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("send_frame", "t", &remote, policy(), &cancel);
        let script = scripted(vec![Err(RpcError::ConnectionLost("reset".into())), Ok(())]);

        let resends = op
            .run(|| step(&script), |s| classify_send(FrameId(4), s))
            .await
            .unwrap();
        assert_eq!(resends, 1);
        assert_eq!(script.1.load(Ordering::SeqCst), 2);
        assert_eq!(remote.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn desynchronized_status_is_fatal() {
        let remote = StatusScript::new(vec![Some(status(Some(TransferState::Started), Some(1)))]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("send_frame", "t", &remote, policy(), &cancel);
        let script = scripted(vec![Err(RpcError::Timeout)]);

        let err = op
            .run(|| step(&script), |s| classify_send(FrameId(4), s))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Desynchronized {
                operation: "send_frame",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_a_communication_failure() {
        let remote = StatusScript::new(vec![None, None, None]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("commit", "t", &remote, policy(), &cancel);
        let script = scripted(vec![Err(RpcError::Timeout)]);

        let started = tokio::time::Instant::now();
        let err = op.run(|| step(&script), classify_commit).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Communication {
                operation: "commit",
                attempts: 3
            }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_fatal_without_recovery() {
        let remote = StatusScript::new(vec![]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("prepare", "t", &remote, policy(), &cancel);
        let script = scripted(vec![Err(RpcError::Rejected {
            code: 400,
            message: "checksum mismatch".into(),
        })]);

        let err = op
            .run(|| step(&script), |s| classify_prepare(FrameId(0), s))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Rejected {
                operation: "prepare",
                code: 400,
                ..
            }
        ));
        assert_eq!(remote.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_times_out_into_recovery() {
        let remote = StatusScript::new(vec![Some(status(Some(TransferState::Committed), None))]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("commit", "t", &remote, policy(), &cancel);

        let resends = op
            .run(
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(status(None, None))
                },
                classify_commit,
            )
            .await
            .unwrap();
        assert_eq!(resends, 0);
        assert_eq!(remote.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_recovery() {
        let remote = StatusScript::new(vec![]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("send_frame", "t", &remote, policy(), &cancel);
        let script = scripted(vec![Err(RpcError::Timeout)]);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });
        let err = op
            .run(|| step(&script), |s| classify_send(FrameId(0), s))
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(remote.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn issued_commit_outlives_cancellation() {
        let remote = StatusScript::new(vec![]);
        let cancel = CancellationToken::new();
        let op = RetryableOperation::new("commit", "t", &remote, policy(), &cancel)
            .ignoring_cancellation();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });
        let resends = op
            .run(
                || async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(status(Some(TransferState::Committed), None))
                },
                classify_commit,
            )
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(resends, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn issued_commit_recovers_after_cancellation() {
        let remote = StatusScript::new(vec![
            None,
            Some(status(Some(TransferState::Committed), None)),
        ]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let op = RetryableOperation::new("commit", "t", &remote, policy(), &cancel)
            .ignoring_cancellation();
        let script = scripted(vec![Err(RpcError::ConnectionLost("reset".into()))]);

        let resends = op.run(|| step(&script), classify_commit).await.unwrap();
        assert_eq!(resends, 0);
        assert_eq!(remote.queries.load(Ordering::SeqCst), 2);
    }
}
