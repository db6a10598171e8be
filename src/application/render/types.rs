use std::{fmt, path::PathBuf};

use thiserror::Error;

use crate::domain::text::ContentKey;

use super::task::CompletionHandle;

/// Terminal result shared by every observer of a render task.
pub type RenderOutcome = Result<PathBuf, RenderError>;

/// Classification attached to a failed renderer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    /// The executable could not be started (missing, not permitted).
    Spawn,
    /// The process exited with a non-zero status.
    ExitStatus,
    /// The process was terminated by a signal.
    Signal,
    /// The process reported success but left no output behind.
    MissingArtifact,
    /// The process exceeded the configured render duration and was killed.
    Timeout,
    /// Staging or publishing the artifact failed.
    Io,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::Spawn => "spawn",
            FailureCode::ExitStatus => "exit_status",
            FailureCode::Signal => "signal",
            FailureCode::MissingArtifact => "missing_artifact",
            FailureCode::Timeout => "timeout",
            FailureCode::Io => "io",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {detail}")]
pub struct RenderFailure {
    pub code: FailureCode,
    pub detail: String,
}

impl RenderFailure {
    pub fn new(code: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Errors delivered through a task's completion handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("worker pool saturated")]
    PoolSaturated,
    #[error("render failed")]
    RenderFailed(#[source] RenderFailure),
    #[error("unexpected render error: {0}")]
    Unknown(String),
}

impl RenderError {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    /// Stable label used for logs and the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::PoolSaturated => "pool_saturated",
            RenderError::RenderFailed(_) => "render_failed",
            RenderError::Unknown(_) => "unknown",
        }
    }
}

impl From<RenderFailure> for RenderError {
    fn from(failure: RenderFailure) -> Self {
        Self::RenderFailed(failure)
    }
}

/// Lifecycle of a render task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Queued = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
}

impl TaskState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Queued,
            1 => TaskState::Running,
            2 => TaskState::Succeeded,
            _ => TaskState::Failed,
        }
    }
}

/// Which path a submission took through the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RejectInvalid,
    Redirect,
    AttachToPending,
    QueueNew,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::RejectInvalid => "REJECT_INVALID",
            Decision::Redirect => "REDIRECT",
            Decision::AttachToPending => "ATTACH_TO_PENDING",
            Decision::QueueNew => "QUEUE_NEW",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted submission.
#[derive(Clone)]
pub enum Submission {
    /// The artifact is already on disk.
    ArtifactReady { key: ContentKey, path: PathBuf },
    /// An identical render is queued or running; this caller observes it.
    Attached(CompletionHandle),
    /// A new render task was handed to the pool.
    Admitted(CompletionHandle),
}

impl Submission {
    pub fn key(&self) -> &ContentKey {
        match self {
            Submission::ArtifactReady { key, .. } => key,
            Submission::Attached(handle) | Submission::Admitted(handle) => handle.key(),
        }
    }

    pub fn decision(&self) -> Decision {
        match self {
            Submission::ArtifactReady { .. } => Decision::Redirect,
            Submission::Attached(_) => Decision::AttachToPending,
            Submission::Admitted(_) => Decision::QueueNew,
        }
    }

    /// Wait for the terminal outcome; ready artifacts resolve immediately.
    pub async fn resolve(self) -> RenderOutcome {
        match self {
            Submission::ArtifactReady { path, .. } => Ok(path),
            Submission::Attached(handle) | Submission::Admitted(handle) => handle.wait().await,
        }
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("decision", &self.decision())
            .field("key", self.key())
            .finish()
    }
}
