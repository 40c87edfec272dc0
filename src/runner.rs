use anyhow::{Context, Result, anyhow, bail};
use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Captured result of a bounded child process
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }
}

/// Run a command, killing it once `timeout` elapses
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    let display = format!("{cmd:?}");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    log::trace!("spawning {display}");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to execute: {display}"))?;

    let stdout = spawn_reader(
        child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?,
    );
    let stderr = spawn_reader(
        child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?,
    );

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (Some(status), false),
        None => {
            log::warn!("{display} timed out after {}s, killing", timeout.as_secs());
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?;
            (None, true)
        }
    };

    let stdout = stdout.collect("stdout", &display)?;
    let stderr = stderr.collect("stderr", &display)?;

    log::trace!("{display} finished with {status:?}");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// How long to keep reading a pipe after the child is gone
///
/// A descendant (e.g. a credential plugin) can inherit the pipe and keep it
/// open; whatever arrived by then is kept.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Pipe drained on a background thread into a shared buffer
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<io::Result<()>>,
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> PipeReader {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let (tx, done) = mpsc::channel();
    let sink = Arc::clone(&buf);
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        let result = loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        // Receiver is gone once the caller stopped waiting
        let _ = tx.send(result);
    });
    PipeReader { buf, done }
}

impl PipeReader {
    fn collect(self, name: &str, display: &str) -> Result<String> {
        match self.done.recv_timeout(READER_GRACE) {
            Ok(result) => result.with_context(|| format!("read {name}"))?,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("{display}: {name} still held open by a descendant; keeping partial output");
            }
            Err(RecvTimeoutError::Disconnected) => bail!("{name} reader thread panicked"),
        }
        let bytes = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(text)
    }
}

/// Check if a command exists
pub fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
