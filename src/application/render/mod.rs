//! Speech render coordination and execution.
//!
//! [`RenderCoordinator`] deduplicates submissions by content key and hands
//! new work to the [`WorkerPool`], which runs a bounded number of renderer
//! processes and keeps a bounded FIFO backlog. Every task ends in exactly one
//! outcome, broadcast to all callers that submitted the same text while it
//! was in flight.

mod coordinator;
mod pool;
mod renderer;
mod task;
mod types;

use std::sync::Arc;

pub use coordinator::RenderCoordinator;
pub use pool::{PoolLimits, PoolSnapshot, WorkerPool};
pub(crate) use pool::{
    METRIC_POOL_BACKLOG, METRIC_POOL_OCCUPIED, METRIC_RENDER_DURATION_MS, METRIC_RENDER_ERRORS_TOTAL,
    METRIC_RENDERS_TOTAL,
};
pub use renderer::{
    CommandRenderer, CommandTemplate, OUTPUT_PLACEHOLDER, RenderJob, Renderer, TEXT_PLACEHOLDER,
};
pub use task::{CompletionHandle, RenderTask};
pub use types::{
    Decision, FailureCode, RenderError, RenderFailure, RenderOutcome, Submission, TaskState,
};

use crate::{config, infra::artifacts::ArtifactStore};

/// Wire the configured renderer, pool and coordinator together.
pub fn build_coordinator(
    settings: &config::Settings,
    artifacts: Arc<ArtifactStore>,
) -> RenderCoordinator {
    let renderer = Arc::new(CommandRenderer::new(CommandTemplate::from(&settings.render)));
    let pool = WorkerPool::new(
        PoolLimits::from(&settings.pool),
        renderer,
        Arc::clone(&artifacts),
    );
    RenderCoordinator::new(artifacts, pool, settings.render.max_text_length.get())
}
