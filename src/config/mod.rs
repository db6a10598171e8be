//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::render::{OUTPUT_PLACEHOLDER, TEXT_PLACEHOLDER};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sonare";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_POOL_MAX_PROCS: u64 = 2;
const DEFAULT_POOL_MAX_QUEUE_DEPTH: u64 = 16;
const DEFAULT_RENDER_EXECUTABLE: &str = "espeak-ng";
const DEFAULT_RENDER_ARGS: [&str; 3] = ["-w", OUTPUT_PLACEHOLDER, TEXT_PLACEHOLDER];
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 120;
const DEFAULT_ARTIFACT_DIR: &str = "files";
const DEFAULT_MAX_TEXT_LENGTH: u64 = 1000;

/// Command-line arguments for the Sonare binary.
#[derive(Debug, Parser)]
#[command(name = "sonare", version, about = "Sonare speech rendering server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SONARE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Render one text through the configured renderer and print the artifact path.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Text to render.
    #[arg(value_name = "TEXT")]
    pub text: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the renderer executable.
    #[arg(long = "render-executable", value_name = "PATH")]
    pub executable: Option<PathBuf>,

    /// Override the directory rendered artifacts are written to.
    #[arg(long = "render-artifact-dir", value_name = "PATH")]
    pub artifact_dir: Option<PathBuf>,

    /// Override the per-render time limit (0 disables it).
    #[arg(long = "render-timeout-seconds", value_name = "SECONDS")]
    pub timeout_seconds: Option<u64>,

    /// Override the maximum accepted text length in characters.
    #[arg(long = "render-max-text-length", value_name = "CHARS")]
    pub max_text_length: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of concurrent renderer processes.
    #[arg(long = "pool-max-procs", value_name = "COUNT")]
    pub pool_max_procs: Option<u64>,

    /// Override the number of renders allowed to wait for a free slot.
    #[arg(long = "pool-max-queue-depth", value_name = "COUNT")]
    pub pool_max_queue_depth: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub pool: PoolSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_procs: NonZeroUsize,
    pub max_queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub text_via_stdin: bool,
    pub timeout: Option<Duration>,
    pub artifact_dir: PathBuf,
    pub max_text_length: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("SONARE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_render_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    pool: RawPoolSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(value) = overrides.pool_max_procs {
            self.pool.max_procs = Some(value);
        }
        if let Some(value) = overrides.pool_max_queue_depth {
            self.pool.max_queue_depth = Some(value);
        }

        self.apply_render_overrides(&overrides.render);
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(path) = overrides.executable.as_ref() {
            self.render.executable = Some(path.clone());
        }
        if let Some(dir) = overrides.artifact_dir.as_ref() {
            self.render.artifact_dir = Some(dir.clone());
        }
        if let Some(seconds) = overrides.timeout_seconds {
            self.render.timeout_seconds = Some(seconds);
        }
        if let Some(length) = overrides.max_text_length {
            self.render.max_text_length = Some(length);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            pool,
            render,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            pool: build_pool_settings(pool)?,
            render: build_render_settings(render)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let max_procs = non_zero_usize(
        pool.max_procs.unwrap_or(DEFAULT_POOL_MAX_PROCS),
        "pool.max_procs",
    )?;
    let max_queue_depth = to_usize(
        pool.max_queue_depth
            .unwrap_or(DEFAULT_POOL_MAX_QUEUE_DEPTH),
        "pool.max_queue_depth",
    )?;

    Ok(PoolSettings {
        max_procs,
        max_queue_depth,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let executable = render
        .executable
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDER_EXECUTABLE));
    if executable.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.executable",
            "path must not be empty",
        ));
    }

    let args = render
        .args
        .unwrap_or_else(|| DEFAULT_RENDER_ARGS.iter().map(|arg| arg.to_string()).collect());
    let text_via_stdin = render.text_via_stdin.unwrap_or(false);
    if !args.iter().any(|arg| arg.contains(OUTPUT_PLACEHOLDER)) {
        return Err(LoadError::invalid(
            "render.args",
            format!("must contain the `{OUTPUT_PLACEHOLDER}` placeholder"),
        ));
    }
    if !text_via_stdin && !args.iter().any(|arg| arg.contains(TEXT_PLACEHOLDER)) {
        return Err(LoadError::invalid(
            "render.args",
            format!("must contain `{TEXT_PLACEHOLDER}` unless `render.text_via_stdin` is set"),
        ));
    }

    let timeout_secs = render
        .timeout_seconds
        .unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS);
    let timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

    let artifact_dir = render
        .artifact_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR));
    if artifact_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.artifact_dir",
            "path must not be empty",
        ));
    }

    let max_text_length = non_zero_usize(
        render.max_text_length.unwrap_or(DEFAULT_MAX_TEXT_LENGTH),
        "render.max_text_length",
    )?;

    Ok(RenderSettings {
        executable,
        args,
        env: render.env.unwrap_or_default(),
        text_via_stdin,
        timeout,
        artifact_dir,
        max_text_length,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    max_procs: Option<u64>,
    max_queue_depth: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    executable: Option<PathBuf>,
    args: Option<Vec<String>>,
    env: Option<BTreeMap<String, String>>,
    text_via_stdin: Option<bool>,
    timeout_seconds: Option<u64>,
    artifact_dir: Option<PathBuf>,
    max_text_length: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn to_usize(value: u64, key: &'static str) -> Result<usize, LoadError> {
    usize::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(to_usize(value, key)?)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
