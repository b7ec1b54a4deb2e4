use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// phases reported by multi-step operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Preparing,
    EstimatingGas,
    Executing,
    Retrying,
    Confirming,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Preparing => "preparing",
            Phase::EstimatingGas => "estimating_gas",
            Phase::Executing => "executing",
            Phase::Retrying => "retrying",
            Phase::Confirming => "confirming",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

/// a progress report with elapsed time since the operation started
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub detail: String,
    pub elapsed: Duration,
}

/// non-blocking progress reporter over a bounded channel
///
/// events are dropped, never awaited, when the receiver lags; progress is
/// advisory and must not stall the operation emitting it.
#[derive(Clone)]
pub struct Progress {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    started: Instant,
}

impl Progress {
    /// create a reporter and its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                started: Instant::now(),
            },
            rx,
        )
    }

    /// reporter that discards everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            started: Instant::now(),
        }
    }

    /// emit an event; silently dropped if nobody listens or the channel is full
    pub fn emit(&self, phase: Phase, detail: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(ProgressEvent {
                phase,
                detail: detail.into(),
                elapsed: self.started.elapsed(),
            });
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::disabled()
    }
}

/// fail fast when the operation has been cancelled
///
/// checked between phases and between retries; in-flight network calls are
/// aborted at their transport boundary.
pub fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_events_flow() {
        let (progress, mut rx) = Progress::channel(8);

        progress.emit(Phase::Preparing, "building transaction");
        progress.emit(Phase::Completed, "done");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.phase, Phase::Preparing);
        assert_eq!(first.detail, "building transaction");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.phase, Phase::Completed);
    }

    #[test]
    fn test_progress_full_channel_drops() {
        let (progress, rx) = Progress::channel(1);
        progress.emit(Phase::Executing, "one");
        // second emit must not block even though nobody drained
        progress.emit(Phase::Executing, "two");
        drop(rx);
        progress.emit(Phase::Executing, "three");
    }

    #[test]
    fn test_disabled_progress() {
        let progress = Progress::disabled();
        progress.emit(Phase::Failed, "nobody hears this");
    }

    #[test]
    fn test_ensure_active() {
        let token = CancellationToken::new();
        assert!(ensure_active(&token).is_ok());

        token.cancel();
        assert!(matches!(ensure_active(&token), Err(Error::Cancelled)));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::EstimatingGas.as_str(), "estimating_gas");
        assert_eq!(Phase::Retrying.as_str(), "retrying");
    }
}
