use std::{
    collections::HashSet,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use sonare::{
    application::render::{
        Decision, FailureCode, PoolLimits, RenderCoordinator, RenderError, RenderFailure,
        RenderJob, Renderer, Submission, WorkerPool,
    },
    domain::text::{ContentKey, InputError},
    infra::artifacts::ArtifactStore,
};
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// In-process renderer that counts invocations and blocks until released.
#[derive(Default)]
struct FakeRenderer {
    calls: Mutex<Vec<String>>,
    gate: Option<Semaphore>,
    failing: HashSet<String>,
}

impl FakeRenderer {
    fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    fn failing(texts: &[&str]) -> Self {
        Self {
            failing: texts.iter().map(|text| text.to_string()).collect(),
            ..Default::default()
        }
    }

    fn release(&self) {
        if let Some(gate) = self.gate.as_ref() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    fn calls_for(&self, text: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|call| call.as_str() == text)
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, job: &RenderJob<'_>) -> Result<(), RenderFailure> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(job.text.to_string());

        if let Some(gate) = self.gate.as_ref() {
            let _permit = gate
                .acquire()
                .await
                .map_err(|err| RenderFailure::new(FailureCode::Io, err.to_string()))?;
        }

        if self.failing.contains(job.text) {
            return Err(RenderFailure::new(FailureCode::ExitStatus, "exit status 1"));
        }

        tokio::fs::write(job.output, format!("RIFF:{}", job.text))
            .await
            .map_err(|err| RenderFailure::new(FailureCode::Io, err.to_string()))
    }
}

struct Harness {
    _dir: TempDir,
    renderer: Arc<FakeRenderer>,
    artifacts: Arc<ArtifactStore>,
    coordinator: Arc<RenderCoordinator>,
}

fn harness(renderer: FakeRenderer, max_procs: usize, max_queue_depth: usize) -> Harness {
    harness_with_limit(renderer, max_procs, max_queue_depth, 1000)
}

fn harness_with_limit(
    renderer: FakeRenderer,
    max_procs: usize,
    max_queue_depth: usize,
    max_text_length: usize,
) -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let artifacts = Arc::new(ArtifactStore::new(dir.path().join("files")).expect("store"));
    let renderer = Arc::new(renderer);
    let pool = WorkerPool::new(
        PoolLimits {
            max_procs: NonZeroUsize::new(max_procs).expect("non-zero procs"),
            max_queue_depth,
        },
        renderer.clone(),
        Arc::clone(&artifacts),
    );
    let coordinator = Arc::new(RenderCoordinator::new(
        Arc::clone(&artifacts),
        pool,
        max_text_length,
    ));
    Harness {
        _dir: dir,
        renderer,
        artifacts,
        coordinator,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_render_once() {
    let h = harness(FakeRenderer::gated(), 2, 16);

    let submits = (0..12).map(|_| {
        let coordinator = Arc::clone(&h.coordinator);
        tokio::spawn(async move { coordinator.submit("hello world").await })
    });
    let submissions: Vec<Submission> = futures::future::join_all(submits)
        .await
        .into_iter()
        .map(|joined| joined.expect("join").expect("valid input"))
        .collect();

    let admitted = submissions
        .iter()
        .filter(|submission| submission.decision() == Decision::QueueNew)
        .count();
    let attached = submissions
        .iter()
        .filter(|submission| submission.decision() == Decision::AttachToPending)
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(attached, 11);
    assert_eq!(h.coordinator.pending_len(), 1);

    h.renderer.release();

    let outcomes = futures::future::join_all(submissions.into_iter().map(Submission::resolve)).await;
    let expected = h.artifacts.path_for(&ContentKey::from_normalized("hello world"));
    for outcome in outcomes {
        assert_eq!(outcome.expect("render succeeded"), expected);
    }

    assert_eq!(h.renderer.total_calls(), 1);
    assert_eq!(h.coordinator.pending_len(), 0);

    let again = h.coordinator.submit("hello world").await.expect("valid input");
    assert_eq!(again.decision(), Decision::Redirect);
    assert_eq!(h.renderer.total_calls(), 1);
}

#[tokio::test]
async fn line_break_variants_share_one_task() {
    let h = harness(FakeRenderer::gated(), 1, 4);

    let first = h.coordinator.submit("a\nb\n\nc").await.expect("valid input");
    let second = h.coordinator.submit("a b  c").await.expect("valid input");

    assert_eq!(first.key(), second.key());
    assert_eq!(first.decision(), Decision::QueueNew);
    assert_eq!(second.decision(), Decision::AttachToPending);

    h.renderer.release();
    first.resolve().await.expect("first resolved");
    second.resolve().await.expect("second resolved");

    assert_eq!(h.renderer.total_calls(), 1);
    assert_eq!(h.renderer.calls_for("a b  c"), 1);
}

#[tokio::test]
async fn existing_artifact_short_circuits_rendering() {
    let h = harness(FakeRenderer::default(), 1, 1);
    let key = ContentKey::from_normalized("cached text");
    std::fs::write(h.artifacts.path_for(&key), b"RIFF").expect("seed artifact");

    let submission = h.coordinator.submit("cached text").await.expect("valid input");

    assert_eq!(submission.decision(), Decision::Redirect);
    assert_eq!(submission.key(), &key);
    assert_eq!(
        submission.resolve().await.expect("ready"),
        h.artifacts.path_for(&key)
    );
    assert_eq!(h.renderer.total_calls(), 0);
    assert_eq!(h.coordinator.pending_len(), 0);
}

#[tokio::test]
async fn input_length_limit_is_inclusive() {
    let h = harness_with_limit(FakeRenderer::default(), 1, 1, 5);

    let accepted = h.coordinator.submit("12345").await.expect("at the limit");
    accepted.resolve().await.expect("rendered");

    let err = h
        .coordinator
        .submit("123456")
        .await
        .expect_err("over the limit");
    assert_eq!(err, InputError::TooLong { length: 6, max: 5 });

    let err = h.coordinator.submit(" \n\t ").await.expect_err("blank");
    assert_eq!(err, InputError::Empty);

    assert_eq!(h.renderer.total_calls(), 1);
}

#[tokio::test]
async fn failures_are_isolated_and_not_cached() {
    let h = harness(FakeRenderer::failing(&["bad input"]), 2, 4);

    let bad = h.coordinator.submit("bad input").await.expect("valid input");
    let good = h.coordinator.submit("good input").await.expect("valid input");

    match bad.resolve().await {
        Err(RenderError::RenderFailed(failure)) => {
            assert_eq!(failure.code, FailureCode::ExitStatus);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    good.resolve().await.expect("good input rendered");

    let key = ContentKey::from_normalized("bad input");
    assert!(!h.artifacts.path_for(&key).exists());
    assert!(!h.coordinator.is_pending(&key));

    let retry = h.coordinator.submit("bad input").await.expect("valid input");
    assert_eq!(retry.decision(), Decision::QueueNew);
    assert!(retry.resolve().await.is_err());
    assert_eq!(h.renderer.calls_for("bad input"), 2);
}

#[tokio::test]
async fn saturated_pool_rejects_without_leaving_pending_entries() {
    let h = harness(FakeRenderer::gated(), 1, 0);

    let running = h.coordinator.submit("first").await.expect("valid input");
    let rejected = h.coordinator.submit("second").await.expect("valid input");

    assert_eq!(rejected.decision(), Decision::QueueNew);
    assert_eq!(rejected.resolve().await, Err(RenderError::PoolSaturated));
    assert!(!h
        .coordinator
        .is_pending(&ContentKey::from_normalized("second")));
    assert_eq!(h.coordinator.pending_len(), 1);

    h.renderer.release();
    running.resolve().await.expect("first rendered");

    let retried = h.coordinator.submit("second").await.expect("valid input");
    assert_eq!(retried.decision(), Decision::QueueNew);
    retried.resolve().await.expect("second rendered after retry");
}

#[tokio::test]
async fn attached_callers_share_the_failure() {
    let renderer = FakeRenderer {
        gate: Some(Semaphore::new(0)),
        failing: HashSet::from(["doomed".to_string()]),
        ..Default::default()
    };
    let h = harness(renderer, 1, 1);

    let owner = h.coordinator.submit("doomed").await.expect("valid input");
    let follower = h.coordinator.submit("doomed").await.expect("valid input");
    assert_eq!(follower.decision(), Decision::AttachToPending);

    h.renderer.release();

    let owner = owner.resolve().await;
    let follower = follower.resolve().await;
    assert!(matches!(owner, Err(RenderError::RenderFailed(_))));
    assert_eq!(owner, follower);
    assert_eq!(h.renderer.total_calls(), 1);
}

#[tokio::test]
async fn distinct_texts_get_distinct_tasks() {
    let h = harness(FakeRenderer::default(), 2, 8);

    for text in ["alpha", "beta", "gamma"] {
        let submission = h.coordinator.submit(text).await.expect("valid input");
        assert_eq!(submission.decision(), Decision::QueueNew);
        submission.resolve().await.expect("rendered");
    }

    assert_eq!(h.renderer.total_calls(), 3);
    assert_eq!(std::fs::read_dir(h.artifacts.root()).expect("dir").count(), 3);
}
