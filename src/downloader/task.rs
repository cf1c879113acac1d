use super::sink::SinkTarget;
use crate::error::ErrorKind;
use crate::model::AssetRef;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Activating,
    Downloading,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self: &Self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Forward-only transitions. Activation can fail before any byte moves;
    /// cancellation is reachable from every live state.
    pub fn can_advance_to(self: &Self, next: TaskState) -> bool {
        use TaskState::*;
        match (*self, next) {
            (Pending, Activating)
            | (Activating, Downloading)
            | (Activating, Failed)
            | (Downloading, Succeeded)
            | (Downloading, Failed) => true,
            (state, Cancelled) => !state.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Activating => "activating",
            Self::Downloading => "downloading",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded { bytes: u64, attempts: u32 },
    Failed(TaskFailure),
    Cancelled,
}

/// Final word on one asset, emitted exactly once per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub asset: AssetRef,
    pub result: TaskResult,
}

/// One asset's trip through activation and transfer. Consumed when it
/// reaches a terminal state.
#[derive(Debug)]
pub struct DownloadTask {
    pub asset: AssetRef,
    pub sink: SinkTarget,
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
    state: TaskState,
}

impl DownloadTask {
    pub fn new(asset: AssetRef, sink: SinkTarget) -> Self {
        Self {
            asset,
            sink,
            attempts: 0,
            last_error: None,
            state: TaskState::Pending,
        }
    }

    pub fn advance(self: &mut Self, next: TaskState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {} for {}",
            self.state,
            next,
            self.asset
        );
        tracing::debug!(asset = %self.asset, from = %self.state, to = %next, "Task transition");
        self.state = next;
    }

    pub fn succeed(mut self, bytes: u64) -> TaskOutcome {
        self.advance(TaskState::Succeeded);
        tracing::info!(asset = %self.asset, bytes, attempts = self.attempts, "Download complete");
        TaskOutcome {
            asset: self.asset,
            result: TaskResult::Succeeded {
                bytes,
                attempts: self.attempts,
            },
        }
    }

    /// `Cancelled` kinds end the task as cancelled rather than failed.
    pub fn fail(mut self, kind: ErrorKind) -> TaskOutcome {
        if kind == ErrorKind::Cancelled {
            return self.cancel();
        }
        self.last_error = Some(kind);
        self.advance(TaskState::Failed);
        tracing::warn!(asset = %self.asset, error = %kind, attempts = self.attempts, "Download failed");
        TaskOutcome {
            asset: self.asset,
            result: TaskResult::Failed(TaskFailure {
                kind,
                attempts: self.attempts,
            }),
        }
    }

    pub fn cancel(mut self) -> TaskOutcome {
        self.advance(TaskState::Cancelled);
        tracing::info!(
            asset = %self.asset,
            attempts = self.attempts,
            last_error = ?self.last_error,
            "Download cancelled"
        );
        TaskOutcome {
            asset: self.asset,
            result: TaskResult::Cancelled,
        }
    }
}
