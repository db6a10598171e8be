use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStderr, ChildStdin, Command},
};
use tracing::{debug, warn};

use crate::domain::text::ContentKey;

use super::types::{FailureCode, RenderFailure};

/// Placeholder replaced with the text to speak.
pub const TEXT_PLACEHOLDER: &str = "{text}";
/// Placeholder replaced with the path the renderer must write to.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

const STDERR_LOG_LIMIT: usize = 2048;

/// Input for a single renderer run.
#[derive(Debug, Clone, Copy)]
pub struct RenderJob<'a> {
    pub key: &'a ContentKey,
    pub text: &'a str,
    pub output: &'a Path,
}

/// Something that turns text into an audio file at `job.output`.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, job: &RenderJob<'_>) -> Result<(), RenderFailure>;
}

/// How to invoke the external renderer executable.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub text_via_stdin: bool,
    pub timeout: Option<Duration>,
}

impl CommandTemplate {
    /// Arguments with `{text}` and `{output}` substituted.
    pub fn interpolate(&self, text: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(OUTPUT_PLACEHOLDER, &output)
                    .replace(TEXT_PLACEHOLDER, text)
            })
            .collect()
    }
}

impl From<&crate::config::RenderSettings> for CommandTemplate {
    fn from(settings: &crate::config::RenderSettings) -> Self {
        Self {
            program: settings.executable.clone(),
            args: settings.args.clone(),
            env: settings.env.clone(),
            text_via_stdin: settings.text_via_stdin,
            timeout: settings.timeout,
        }
    }
}

/// Runs the configured executable as a child process per render.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    template: CommandTemplate,
}

impl CommandRenderer {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, job: &RenderJob<'_>) -> Result<(), RenderFailure> {
        let started_at = Instant::now();
        let template = &self.template;

        let mut command = Command::new(&template.program);
        command
            .args(template.interpolate(job.text, job.output))
            .envs(&template.env)
            .stdin(if template.text_via_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            warn!(
                target = "application::render::renderer",
                op = "renderer::spawn",
                result = "error",
                key = %job.key,
                program = %template.program.display(),
                error_code = FailureCode::Spawn.as_str(),
                error = %err,
                "Failed to spawn renderer"
            );
            RenderFailure::new(
                FailureCode::Spawn,
                format!("{}: {err}", template.program.display()),
            )
        })?;

        // The stdin write runs under the time limit too.
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let (status, stderr) = match template.timeout {
            Some(limit) => {
                let finished = tokio::time::timeout(
                    limit,
                    drive_to_exit(&mut child, stdin, job.text, stderr),
                )
                .await;
                match finished {
                    Ok(finished) => finished,
                    Err(_) => {
                        if let Err(err) = child.kill().await {
                            warn!(
                                target = "application::render::renderer",
                                op = "renderer::kill",
                                key = %job.key,
                                error = %err,
                                "Failed to kill timed out renderer"
                            );
                        }
                        warn!(
                            target = "application::render::renderer",
                            op = "renderer::render",
                            result = "error",
                            key = %job.key,
                            elapsed_ms = started_at.elapsed().as_millis() as u64,
                            timeout_ms = limit.as_millis() as u64,
                            error_code = FailureCode::Timeout.as_str(),
                            "Renderer exceeded time limit"
                        );
                        return Err(RenderFailure::new(
                            FailureCode::Timeout,
                            format!("renderer exceeded {}s", limit.as_secs_f64()),
                        ));
                    }
                }
            }
            None => drive_to_exit(&mut child, stdin, job.text, stderr).await,
        };

        let status = status
            .map_err(|err| RenderFailure::new(FailureCode::Io, format!("wait failed: {err}")))?;

        if status.success() {
            debug!(
                target = "application::render::renderer",
                op = "renderer::render",
                result = "ok",
                key = %job.key,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Renderer finished"
            );
            return Ok(());
        }

        let failure = classify_exit(status, &stderr);
        warn!(
            target = "application::render::renderer",
            op = "renderer::render",
            result = "error",
            key = %job.key,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            exit_code = status.code().map(i64::from).unwrap_or(-1),
            error_code = failure.code.as_str(),
            stderr = %stderr,
            "Renderer invocation failed"
        );
        Err(failure)
    }
}

async fn write_stdin(mut stdin: ChildStdin, text: &str) {
    // A renderer that exits without reading stdin is judged by its exit status.
    if let Err(err) = stdin.write_all(text.as_bytes()).await {
        if err.kind() != ErrorKind::BrokenPipe {
            warn!(
                target = "application::render::renderer",
                op = "renderer::stdin",
                error = %err,
                "Failed to write text to renderer stdin"
            );
        }
    }
}

/// Write the text to stdin (if piped), drain stderr and wait for exit, all at once.
async fn drive_to_exit(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    text: &str,
    stderr: Option<ChildStderr>,
) -> (std::io::Result<ExitStatus>, String) {
    let feed_stdin = async {
        if let Some(stdin) = stdin {
            write_stdin(stdin, text).await;
        }
    };
    let read_stderr = async {
        let mut buffer = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buffer).await;
        }
        buffer
    };
    let ((), status, buffer) = tokio::join!(feed_stdin, child.wait(), read_stderr);
    (status, truncate_lossy(&buffer, STDERR_LOG_LIMIT))
}

fn classify_exit(status: ExitStatus, stderr: &str) -> RenderFailure {
    match status.code() {
        Some(code) => RenderFailure::new(
            FailureCode::ExitStatus,
            format!("exit code {code}: {stderr}"),
        ),
        None => RenderFailure::new(FailureCode::Signal, signal_detail(status)),
    }
}

#[cfg(unix)]
fn signal_detail(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => "terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_detail(_status: ExitStatus) -> String {
    "terminated abnormally".to_string()
}

fn truncate_lossy(bytes: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    let mut end = limit;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(args: &[&str]) -> CommandTemplate {
        CommandTemplate {
            program: PathBuf::from("espeak-ng"),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: BTreeMap::new(),
            text_via_stdin: false,
            timeout: None,
        }
    }

    #[test]
    fn interpolates_text_and_output() {
        let template = template(&["-w", "{output}", "--", "{text}"]);
        let args = template.interpolate("hello there", Path::new("/srv/files/a.wav"));
        assert_eq!(args, ["-w", "/srv/files/a.wav", "--", "hello there"]);
    }

    #[test]
    fn placeholders_inside_larger_arguments() {
        let template = template(&["--output_file={output}"]);
        let args = template.interpolate("ignored", Path::new("out.wav"));
        assert_eq!(args, ["--output_file=out.wav"]);
    }

    #[test]
    fn text_is_not_reinterpreted_as_placeholder() {
        let template = template(&["{text}"]);
        let args = template.interpolate("say {output}", Path::new("out.wav"));
        assert_eq!(args, ["say {output}"]);
    }

    #[test]
    fn truncates_long_stderr_on_char_boundary() {
        let noisy = "é".repeat(10);
        let truncated = truncate_lossy(noisy.as_bytes(), 5);
        assert_eq!(truncated, "éé…");
    }
}
