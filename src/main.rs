use std::{future::IntoFuture, net::SocketAddr, process, sync::Arc};

use sonare::{
    application::{error::AppError, render},
    config,
    infra::{
        artifacts::ArtifactStore,
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
    }
}

fn open_artifact_store(settings: &config::Settings) -> Result<Arc<ArtifactStore>, AppError> {
    let store = ArtifactStore::new(settings.render.artifact_dir.clone()).map_err(InfraError::from)?;
    Ok(Arc::new(store))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let metrics = telemetry::install_metrics_recorder()?;
    let artifacts = open_artifact_store(&settings)?;
    let coordinator = Arc::new(render::build_coordinator(&settings, Arc::clone(&artifacts)));

    info!(
        target = "sonare::serve",
        addr = %settings.server.addr,
        artifact_dir = %artifacts.root().display(),
        max_procs = settings.pool.max_procs.get(),
        max_queue_depth = settings.pool.max_queue_depth,
        renderer = %settings.render.executable.display(),
        "starting HTTP server"
    );

    let state = HttpState {
        coordinator,
        artifacts,
        metrics: Some(metrics),
    };
    serve_http(&settings, state).await
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let artifacts = open_artifact_store(&settings)?;
    let coordinator = render::build_coordinator(&settings, artifacts);

    let submission = coordinator.submit(&args.text).await?;
    let key = submission.key().clone();
    let decision = submission.decision();
    let path = submission.resolve().await?;

    let summary = serde_json::json!({
        "key": key.as_str(),
        "file": key.file_name(),
        "path": path.display().to_string(),
        "decision": decision.as_str(),
    });
    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| AppError::unexpected(format!("failed to encode summary: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    })
    .into_future();
    tokio::pin!(server);

    let grace = settings.server.graceful_shutdown;
    tokio::select! {
        result = &mut server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        Ok(()) = signalled_rx => {
            info!(
                target = "sonare::serve",
                grace_seconds = grace.as_secs(),
                "shutdown requested, draining connections"
            );
            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => {
                    result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
                }
                Err(_) => {
                    warn!(
                        target = "sonare::serve",
                        grace_seconds = grace.as_secs(),
                        "graceful shutdown timed out, dropping open connections"
                    );
                }
            }
        }
    }

    info!(target = "sonare::serve", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "sonare::serve", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "sonare::serve", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
