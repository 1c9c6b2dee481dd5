//! Isolated child-process execution.
//!
//! Used for the fetch and build stages and for out-of-process validation
//! checks. Children run with a cleared environment (plus an allowlist),
//! captured output and a hard timeout: on expiry they get SIGTERM, a short
//! grace period, then SIGKILL.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Environment variables passed through from the parent process.
pub const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR", "USER"];

/// Bytes of stdout/stderr retained per stream (the tail is kept).
const OUTPUT_LIMIT: usize = 16 * 1024;

const TERMINATION_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors launching or waiting on a child.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting on child: {0}")]
    Wait(#[from] io::Error),
}

/// A command line plus its execution context.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Variables added on top of the allowlist
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Build from an argv template, substituting `{name}` placeholders.
    pub fn from_template(
        argv: &[String],
        vars: &BTreeMap<&str, String>,
    ) -> Result<Self, ProcessError> {
        let mut expanded = argv.iter().map(|arg| expand(arg, vars));
        let program = expanded.next().ok_or(ProcessError::EmptyCommand)?;
        if program.trim().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        Ok(Self {
            program,
            args: expanded.collect(),
            cwd: None,
            env: BTreeMap::new(),
        })
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    /// Display form for logs and audit details.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn expand(arg: &str, vars: &BTreeMap<&str, String>) -> String {
    vars.iter().fold(arg.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Outcome of a finished (or killed) child.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    /// Terminating signal name, if killed by one
    pub signal: Option<String>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// One-line failure description.
    pub fn describe_failure(&self) -> String {
        if self.timed_out {
            return format!("timed out after {:.1}s", self.duration.as_secs_f64());
        }
        let status = match (self.exit_code, &self.signal) {
            (Some(code), _) => format!("exited with status {}", code),
            (None, Some(sig)) => format!("killed by {}", sig),
            (None, None) => "terminated abnormally".to_string(),
        };
        let tail = last_line(&self.stderr).or_else(|| last_line(&self.stdout));
        match tail {
            Some(line) => format!("{}: {}", status, line),
            None => status,
        }
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Run `spec` to completion or until `timeout` elapses.
pub fn run(spec: &ProcessSpec, timeout: Duration) -> Result<ProcessOutput, ProcessError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for key in ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    command.envs(&spec.env);
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }
    // Own process group so a timeout kill reaches grandchildren holding our pipes.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    tracing::debug!(command = %spec.display(), timeout_s = timeout.as_secs(), "spawning child");
    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());

    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            tracing::warn!(command = %spec.display(), "child timed out, terminating");
            timed_out = true;
            terminate(&mut child)?;
            break child.wait()?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let signal = if status.code().is_none() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(|s| format!("SIG{}", s))
        }
        #[cfg(not(unix))]
        {
            None
        }
    } else {
        None
    };

    Ok(ProcessOutput {
        exit_code: status.code(),
        signal,
        timed_out,
        stdout: join_capture(stdout),
        stderr: join_capture(stderr),
        duration: start.elapsed(),
    })
}

/// Terminate a child's process group gracefully then forcefully.
fn terminate(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(child.id() as i32);
        let _ = signal::killpg(pgid, Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }

    let start = Instant::now();
    while start.elapsed() < TERMINATION_GRACE {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let _ = signal::killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    }
    let _ = child.kill();
    Ok(())
}

fn capture<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut kept = Vec::new();
            let mut buf = [0u8; 8192];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 {
                    break;
                }
                kept.extend_from_slice(&buf[..n]);
                if kept.len() > OUTPUT_LIMIT {
                    let excess = kept.len() - OUTPUT_LIMIT;
                    kept.drain(..excess);
                }
            }
            kept
        })
    })
}

fn join_capture(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
