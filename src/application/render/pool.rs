use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Instant,
};

use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use tracing::{info, warn};

use crate::{
    domain::text::ContentKey,
    infra::artifacts::{ArtifactError, ArtifactStore},
    util::lock::mutex_lock,
};

use super::{
    renderer::{RenderJob, Renderer},
    task::RenderTask,
    types::{FailureCode, RenderError, RenderFailure, RenderOutcome},
};

const SOURCE: &str = "application::render::pool";

pub(crate) const METRIC_POOL_OCCUPIED: &str = "sonare_pool_occupied";
pub(crate) const METRIC_POOL_BACKLOG: &str = "sonare_pool_backlog";
pub(crate) const METRIC_RENDER_DURATION_MS: &str = "sonare_render_duration_ms";
pub(crate) const METRIC_RENDERS_TOTAL: &str = "sonare_renders_total";
pub(crate) const METRIC_RENDER_ERRORS_TOTAL: &str = "sonare_render_errors_total";

/// Concurrency and backlog bounds of a [`WorkerPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_procs: NonZeroUsize,
    pub max_queue_depth: usize,
}

impl From<&crate::config::PoolSettings> for PoolLimits {
    fn from(settings: &crate::config::PoolSettings) -> Self {
        Self {
            max_procs: settings.max_procs,
            max_queue_depth: settings.max_queue_depth,
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub occupied: usize,
    pub backlog: Vec<ContentKey>,
}

#[derive(Default)]
struct PoolState {
    occupied: usize,
    backlog: VecDeque<RenderTask>,
}

struct PoolInner {
    limits: PoolLimits,
    renderer: Arc<dyn Renderer>,
    artifacts: Arc<ArtifactStore>,
    state: Mutex<PoolState>,
}

/// Bounded executor for render tasks.
///
/// At most `max_procs` tasks run at once and at most `max_queue_depth` wait
/// in a FIFO backlog; anything beyond that is failed with
/// [`RenderError::PoolSaturated`]. A finishing task hands its slot straight
/// to the oldest backlog entry, and that hand-off is the only place a slot is
/// released.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        limits: PoolLimits,
        renderer: Arc<dyn Renderer>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limits,
                renderer,
                artifacts,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Admit a task: run it now, queue it, or reject it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, task: RenderTask) {
        let limits = self.inner.limits;
        let mut state = mutex_lock(&self.inner.state, SOURCE, "enqueue");

        if state.occupied < limits.max_procs.get() {
            state.occupied += 1;
            publish_gauges(&state);
            drop(state);
            info!(
                target = SOURCE,
                op = "pool::enqueue",
                result = "started",
                key = %task.key(),
                "Render task started immediately"
            );
            self.inner.start(task);
            return;
        }

        if state.backlog.len() < limits.max_queue_depth {
            info!(
                target = SOURCE,
                op = "pool::enqueue",
                result = "queued",
                key = %task.key(),
                position = state.backlog.len() + 1,
                "Render task queued"
            );
            state.backlog.push_back(task);
            publish_gauges(&state);
            return;
        }

        let backlog = state.backlog.len();
        drop(state);
        warn!(
            target = SOURCE,
            op = "pool::enqueue",
            result = "saturated",
            key = %task.key(),
            backlog,
            max_queue_depth = limits.max_queue_depth,
            "Render pool saturated; rejecting task"
        );
        let error = RenderError::PoolSaturated;
        counter!(METRIC_RENDER_ERRORS_TOTAL, "kind" => error.kind()).increment(1);
        task.finish(Err(error));
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = mutex_lock(&self.inner.state, SOURCE, "snapshot");
        PoolSnapshot {
            occupied: state.occupied,
            backlog: state
                .backlog
                .iter()
                .map(|task| task.key().clone())
                .collect(),
        }
    }
}

impl PoolInner {
    fn start(self: &Arc<Self>, task: RenderTask) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut next = Some(task);
            while let Some(task) = next {
                inner.run(task).await;
                next = inner.release_slot();
            }
        });
    }

    /// Free the caller's slot, or pass it on to the head of the backlog.
    fn release_slot(&self) -> Option<RenderTask> {
        let mut state = mutex_lock(&self.state, SOURCE, "release_slot");
        let next = state.backlog.pop_front();
        if next.is_none() {
            state.occupied = state.occupied.saturating_sub(1);
        }
        publish_gauges(&state);
        next
    }

    async fn run(&self, task: RenderTask) {
        let started_at = Instant::now();
        task.mark_running();

        let outcome = AssertUnwindSafe(self.execute(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(RenderError::unknown("render panicked")));

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!(METRIC_RENDER_DURATION_MS).record(elapsed_ms as f64);
        match &outcome {
            Ok(path) => {
                counter!(METRIC_RENDERS_TOTAL, "result" => "succeeded").increment(1);
                info!(
                    target = SOURCE,
                    op = "pool::run",
                    result = "succeeded",
                    key = %task.key(),
                    elapsed_ms,
                    artifact = %path.display(),
                    "Render task succeeded"
                );
            }
            Err(error) => {
                counter!(METRIC_RENDERS_TOTAL, "result" => "failed").increment(1);
                counter!(METRIC_RENDER_ERRORS_TOTAL, "kind" => error.kind()).increment(1);
                warn!(
                    target = SOURCE,
                    op = "pool::run",
                    result = "failed",
                    key = %task.key(),
                    elapsed_ms,
                    error_kind = error.kind(),
                    error = %error,
                    detail = ?error,
                    "Render task failed"
                );
            }
        }

        task.finish(outcome);
    }

    async fn execute(&self, task: &RenderTask) -> RenderOutcome {
        let staging = self.artifacts.staging_file().map_err(|err| {
            RenderFailure::new(FailureCode::Io, format!("staging file: {err}"))
        })?;

        let job = RenderJob {
            key: task.key(),
            text: task.text(),
            output: staging.path(),
        };
        self.renderer.render(&job).await?;

        self.artifacts
            .publish(staging, task.artifact_path().to_path_buf())
            .await
            .map_err(|err| match err {
                ArtifactError::Empty => RenderError::from(RenderFailure::new(
                    FailureCode::MissingArtifact,
                    "renderer exited successfully without writing output",
                )),
                other => RenderError::from(RenderFailure::new(
                    FailureCode::Io,
                    format!("publish artifact: {other}"),
                )),
            })
    }
}

fn publish_gauges(state: &PoolState) {
    gauge!(METRIC_POOL_OCCUPIED).set(state.occupied as f64);
    gauge!(METRIC_POOL_BACKLOG).set(state.backlog.len() as f64);
}
