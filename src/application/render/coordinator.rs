use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    domain::text::{self, ContentKey, InputError},
    infra::artifacts::ArtifactStore,
};

use super::{
    pool::{METRIC_RENDER_ERRORS_TOTAL, WorkerPool},
    task::{CompletionHandle, RenderTask},
    types::Submission,
};

const SOURCE: &str = "application::render::coordinator";

type PendingMap = DashMap<ContentKey, PendingEntry>;

struct PendingEntry {
    task_id: Uuid,
    handle: CompletionHandle,
}

/// Removes a task's pending entry when the task finishes or is dropped.
pub(crate) struct Registration {
    key: ContentKey,
    task_id: Uuid,
    pending: Arc<PendingMap>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let task_id = self.task_id;
        self.pending.remove_if(&self.key, |_, entry| entry.task_id == task_id);
    }
}

/// Front door for render requests.
///
/// Guarantees at most one queued or running task per [`ContentKey`]: the
/// registry lookup, the artifact re-check and the insert all happen under
/// the registry's entry lock, so concurrent submissions of the same text
/// either attach to the admitted task or see the finished artifact.
pub struct RenderCoordinator {
    artifacts: Arc<ArtifactStore>,
    pool: WorkerPool,
    pending: Arc<PendingMap>,
    max_text_length: usize,
}

impl RenderCoordinator {
    pub fn new(artifacts: Arc<ArtifactStore>, pool: WorkerPool, max_text_length: usize) -> Self {
        Self {
            artifacts,
            pool,
            pending: Arc::new(DashMap::new()),
            max_text_length,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Number of keys with a queued or running task.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &ContentKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Resolve `raw` to a ready artifact, an in-flight task, or a new task.
    pub async fn submit(&self, raw: &str) -> Result<Submission, InputError> {
        let input = text::validate(raw, self.max_text_length).inspect_err(|err| {
            counter!(METRIC_RENDER_ERRORS_TOTAL, "kind" => "invalid_input").increment(1);
            debug!(target = SOURCE, op = "coordinator::submit", error = %err, "Rejected input");
        })?;
        let normalized = text::normalize(input);
        let key = ContentKey::from_normalized(&normalized);

        match self.artifacts.exists(&key).await {
            Ok(true) => return Ok(self.ready(key)),
            Ok(false) => {}
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "coordinator::submit",
                    key = %key,
                    error = %err,
                    "Artifact existence check failed; falling back to registry"
                );
            }
        }

        let task = match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(
                    target = SOURCE,
                    op = "coordinator::submit",
                    result = "attached",
                    key = %key,
                    "Attached to pending render"
                );
                return Ok(Submission::Attached(entry.get().handle.clone()));
            }
            Entry::Vacant(entry) => {
                // The previous task for this key may have published between
                // the fast-path check and taking the entry lock.
                if self.artifacts.exists_now(&key) {
                    return Ok(self.ready(key));
                }

                let artifact_path = self.artifacts.path_for(&key);
                let task = RenderTask::new(key.clone(), artifact_path, normalized);
                let task_id = task.id();
                let task = task.with_registration(Registration {
                    key: key.clone(),
                    task_id,
                    pending: Arc::clone(&self.pending),
                });
                entry.insert(PendingEntry {
                    task_id,
                    handle: task.handle(),
                });
                task
            }
        };

        debug!(
            target = SOURCE,
            op = "coordinator::submit",
            result = "admitted",
            key = %key,
            "Admitting new render task"
        );
        let handle = task.handle();
        self.pool.enqueue(task);
        Ok(Submission::Admitted(handle))
    }

    fn ready(&self, key: ContentKey) -> Submission {
        let path = self.artifacts.path_for(&key);
        Submission::ArtifactReady { key, path }
    }
}
