//! Engine subprocess ownership and line-oriented I/O over its stdio.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;

/// How to launch an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub silence_stderr: bool,
}

/// Owned engine subprocess. Dropping it kills the process.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    pub fn spawn(
        command: &EngineCommand,
        cancel: CancellationToken,
    ) -> Result<(Self, EngineIo), EngineError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if command.silence_stderr {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Spawn(format!("{}: {e}", command.program.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Spawn("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("engine stdout unavailable".to_string()))?;

        debug!(program = %command.program.display(), pid = child.id(), "engine spawned");
        Ok((Self { child }, EngineIo::new(stdout, stdin, cancel)))
    }

    /// Waits up to `grace` for the process to exit on its own, then kills it.
    pub async fn shutdown(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "engine exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait for engine"),
            Err(_) => {
                warn!(?grace, "engine did not exit in time, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill engine");
                }
            }
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line transport to an engine. Every read is bounded by a deadline and by the
/// cancellation token.
pub struct EngineIo {
    lines: Lines<BufReader<BoxedReader>>,
    writer: BoxedWriter,
    cancel: CancellationToken,
}

impl EngineIo {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        cancel: CancellationToken,
    ) -> Self {
        let reader: BoxedReader = Box::new(reader);
        Self {
            lines: BufReader::new(reader).lines(),
            writer: Box::new(writer),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn send(&mut self, cmd: &str) -> Result<(), EngineError> {
        debug!(cmd, "engine <");
        self.writer.write_all(format!("{cmd}\n").as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next non-empty line, or an error once `deadline` passes.
    pub async fn read_line(&mut self, deadline: Instant, waiting_for: &str) -> Result<String, EngineError> {
        self.read_line_since(Instant::now(), deadline, waiting_for).await
    }

    async fn read_line_since(
        &mut self,
        started: Instant,
        deadline: Instant,
        waiting_for: &str,
    ) -> Result<String, EngineError> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                res = tokio::time::timeout_at(deadline, self.lines.next_line()) => res,
            };
            let line = match next {
                Err(_) => {
                    return Err(EngineError::Timeout {
                        waiting_for: waiting_for.to_string(),
                        after: started.elapsed(),
                    })
                }
                Ok(Err(e)) => return Err(EngineError::Io(e)),
                Ok(Ok(None)) => return Err(EngineError::Exited),
                Ok(Ok(Some(line))) => line,
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!(line = trimmed, "engine >");
            return Ok(trimmed.to_string());
        }
    }

    /// Reads until a line satisfies `done`, returning that line.
    pub async fn wait_for(
        &mut self,
        deadline: Instant,
        waiting_for: &str,
        mut done: impl FnMut(&str) -> bool + Send,
    ) -> Result<String, EngineError> {
        let started = Instant::now();
        loop {
            let line = self.read_line_since(started, deadline, waiting_for).await?;
            if done(&line) {
                return Ok(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_line_skips_blank_lines() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let mut io = EngineIo::new(r, w, CancellationToken::new());
        let (_tr, mut tw) = tokio::io::split(theirs);
        tw.write_all(b"\n  \nreadyok\n").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(io.read_line(deadline, "readyok").await.unwrap(), "readyok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_line_times_out() {
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let mut io = EngineIo::new(r, w, CancellationToken::new());

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = io.read_line(deadline, "uciok").await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_read_line_cancelled() {
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let cancel = CancellationToken::new();
        let mut io = EngineIo::new(r, w, cancel.clone());
        cancel.cancel();

        let deadline = Instant::now() + Duration::from_secs(60);
        assert!(matches!(io.read_line(deadline, "bestmove").await, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_eof_is_exited() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let mut io = EngineIo::new(r, w, CancellationToken::new());
        drop(theirs);

        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(io.read_line(deadline, "uciok").await, Err(EngineError::Exited)));
    }
}
