use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::domain::text::ContentKey;

use super::{
    coordinator::Registration,
    types::{RenderError, RenderOutcome, TaskState},
};

/// One unit of render work, owned by the pool once enqueued.
///
/// Finishing a task releases its pending-registry entry before the outcome is
/// broadcast, so a submission arriving after the broadcast either finds the
/// artifact on disk or starts a fresh render. Dropping an unfinished task
/// resolves observers with [`RenderError::Unknown`].
pub struct RenderTask {
    id: Uuid,
    key: ContentKey,
    artifact_path: PathBuf,
    text: String,
    state: Arc<AtomicU8>,
    registration: Option<Registration>,
    sender: Option<oneshot::Sender<RenderOutcome>>,
    handle: CompletionHandle,
}

impl RenderTask {
    pub fn new(key: ContentKey, artifact_path: PathBuf, text: String) -> Self {
        let (sender, receiver) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(TaskState::Queued as u8));
        let outcome = receiver
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(RenderError::unknown(
                        "render task dropped before completion",
                    ))
                })
            })
            .boxed()
            .shared();

        let handle = CompletionHandle {
            key: key.clone(),
            state: Arc::clone(&state),
            outcome,
        };

        Self {
            id: Uuid::new_v4(),
            key,
            artifact_path,
            text,
            state,
            registration: None,
            sender: Some(sender),
            handle,
        }
    }

    pub(crate) fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// A fresh handle observing this task's outcome.
    pub fn handle(&self) -> CompletionHandle {
        self.handle.clone()
    }

    pub(crate) fn mark_running(&self) {
        self.state.store(TaskState::Running as u8, Ordering::Release);
    }

    /// Record the terminal state, release the registry entry, then notify observers.
    pub(crate) fn finish(mut self, outcome: RenderOutcome) {
        let state = if outcome.is_ok() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        self.state.store(state as u8, Ordering::Release);
        drop(self.registration.take());
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(outcome);
        }
    }
}

impl Drop for RenderTask {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.state.store(TaskState::Failed as u8, Ordering::Release);
        }
    }
}

impl fmt::Debug for RenderTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTask")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Cloneable view of a task's eventual outcome.
///
/// Every clone resolves to the same value; awaiting one clone (or dropping
/// it) has no effect on the task or on other observers.
#[derive(Clone)]
pub struct CompletionHandle {
    key: ContentKey,
    state: Arc<AtomicU8>,
    outcome: Shared<BoxFuture<'static, RenderOutcome>>,
}

impl CompletionHandle {
    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub async fn wait(&self) -> RenderOutcome {
        self.outcome.clone().await
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
