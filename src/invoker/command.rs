use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{CancelToken, LiteratureTool};
use crate::error::InvokeError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program args...` to completion, killing it when `timeout` elapses or
/// `cancel` is tripped. A non-zero exit is an error carrying the captured
/// stderr; stderr on a zero exit is returned for the caller to report.
pub fn run_with_deadline(
    program: &str,
    args: &[String],
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<CommandOutput, InvokeError> {
    let rendered = render_command(program, args);
    if cancel.is_cancelled() {
        return Err(InvokeError::Cancelled { what: rendered });
    }

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| InvokeError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                kill(&mut child);
                return Err(InvokeError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
        }

        if cancel.is_cancelled() {
            kill(&mut child);
            return Err(InvokeError::Cancelled { what: rendered });
        }
        if started.elapsed() >= timeout {
            kill(&mut child);
            return Err(InvokeError::Timeout {
                what: rendered,
                after: timeout,
            });
        }

        thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(stdout_reader);
    let stderr = collect(stderr_reader);
    debug!(command = %rendered, status = %status, elapsed_ms = started.elapsed().as_millis() as u64, "command finished");

    if !status.success() {
        return Err(InvokeError::ExitStatus {
            command: rendered,
            status: status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn render_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().map(|arg| {
        if arg.contains(char::is_whitespace) {
            let preview: String = arg.chars().take(40).collect();
            format!("\"{preview}...\"")
        } else {
            arg.clone()
        }
    }));
    parts.join(" ")
}

/// Literature index/query tool driven through an external command line such
/// as `poetry run cellsem-agent paperqa`.
#[derive(Debug, Clone)]
pub struct CommandLiteratureTool {
    program: String,
    prefix_args: Vec<String>,
    timeout: Duration,
}

impl CommandLiteratureTool {
    pub fn new(program: impl Into<String>, prefix_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            prefix_args,
            timeout,
        }
    }

    /// Splits a whitespace-separated command line into program and leading
    /// arguments. Returns `None` for an empty line.
    pub fn from_command_line(command_line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(ToOwned::to_owned);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }

    fn invoke(&self, mode_args: Vec<String>, cancel: &CancelToken) -> Result<String, InvokeError> {
        let mut args = self.prefix_args.clone();
        args.extend(mode_args);

        let output = run_with_deadline(&self.program, &args, self.timeout, cancel)?;
        if !output.stderr.trim().is_empty() {
            warn!(
                program = %self.program,
                diagnostics = %output.stderr.trim(),
                "literature command reported diagnostics"
            );
        }
        Ok(output.stdout)
    }
}

impl LiteratureTool for CommandLiteratureTool {
    fn index(&self, literature_dir: &Path, cancel: &CancelToken) -> Result<(), InvokeError> {
        let dir = absolute(literature_dir);
        self.invoke(
            vec!["index".to_string(), "-d".to_string(), dir.display().to_string()],
            cancel,
        )
        .map(|_| ())
    }

    fn ask(
        &self,
        literature_dir: &Path,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<String, InvokeError> {
        let dir = absolute(literature_dir);
        self.invoke(
            vec![
                "ask".to_string(),
                query.to_string(),
                "-d".to_string(),
                dir.display().to_string(),
            ],
            cancel,
        )
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::{CommandLiteratureTool, run_with_deadline};
    use crate::error::InvokeError;
    use crate::invoker::{CancelToken, LiteratureTool};

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn run_with_deadline_captures_stdout_and_stderr() {
        let output = run_with_deadline(
            "sh",
            &sh("echo out; echo warn 1>&2"),
            Duration::from_secs(10),
            &CancelToken::new(),
        )
        .expect("command should succeed");
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "warn");
    }

    #[test]
    fn run_with_deadline_reports_non_zero_exit_with_stderr() {
        let err = run_with_deadline(
            "sh",
            &sh("echo broken index 1>&2; exit 3"),
            Duration::from_secs(10),
            &CancelToken::new(),
        )
        .expect_err("command should fail");
        match err {
            InvokeError::ExitStatus { status, stderr, .. } => {
                assert_eq!(status, "3");
                assert_eq!(stderr, "broken index");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn run_with_deadline_kills_hung_process() {
        let err = run_with_deadline(
            "sh",
            &sh("sleep 30"),
            Duration::from_millis(200),
            &CancelToken::new(),
        )
        .expect_err("command should time out");
        assert!(err.is_timeout());
    }

    #[test]
    fn run_with_deadline_refuses_to_start_when_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_with_deadline("sh", &sh("true"), Duration::from_secs(10), &cancel)
            .expect_err("cancelled token should stop the call");
        assert!(matches!(err, InvokeError::Cancelled { .. }));
    }

    #[test]
    fn literature_tool_passes_mode_query_and_directory() {
        let tool = CommandLiteratureTool::new(
            "sh",
            sh(r#"printf '%s|' "$@""#)
                .into_iter()
                .chain(["argv0".to_string()])
                .collect(),
            Duration::from_secs(10),
        );
        let dir = tempfile::tempdir().expect("tempdir");

        let stdout = tool
            .ask(dir.path(), "is it true?", &CancelToken::new())
            .expect("ask should succeed");
        let expected = format!("ask|is it true?|-d|{}|", dir.path().display());
        assert_eq!(stdout, expected);
    }

    #[test]
    fn from_command_line_rejects_empty_line() {
        assert!(CommandLiteratureTool::from_command_line("  ", Duration::from_secs(1)).is_none());
        let tool = CommandLiteratureTool::from_command_line(
            "poetry run cellsem-agent paperqa",
            Duration::from_secs(1),
        )
        .expect("tool");
        assert_eq!(tool.program, "poetry");
        assert_eq!(tool.prefix_args, vec!["run", "cellsem-agent", "paperqa"]);
    }
}
