//! Child processes via tokio.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::debug;

use super::{CommandSpec, ManagedProcess, OutputLine, ProcessExit, ProcessSpawner, Stream};

/// Spawns real processes with piped stdio
#[derive(Debug, Default, Clone)]
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, Stream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, Stream::Stderr, tx);
        }

        debug!(pid = ?child.id(), command = %spec.display(), "Spawned process");

        Ok(Box::new(TokioProcess {
            stdin: child.stdin.take(),
            child,
            output: Some(rx),
        }))
    }
}

fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if tx.send(OutputLine { stream, text }).is_err() {
                break;
            }
        }
    });
}

struct TokioProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
}

#[async_trait]
impl ManagedProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn request_stop(&mut self) -> Result<()> {
        let mut stdin = self
            .stdin
            .take()
            .context("Process stdin already closed")?;
        stdin
            .write_all(b"q")
            .await
            .context("Failed to write stop request to stdin")?;
        stdin.flush().await.context("Failed to flush stdin")?;
        // Dropping stdin closes it, which ffmpeg also treats as a stop
        Ok(())
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        let status = self.child.wait().await.context("Failed to wait for process")?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.context("Failed to kill process")
    }

    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.output.take()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_collect_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops 1>&2; exit 3"]);
        let mut process = TokioSpawner::new().spawn(&spec).await.unwrap();
        let mut output = process.take_output().unwrap();

        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));

        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        assert!(lines.contains(&OutputLine {
            stream: Stream::Stdout,
            text: "hello".to_string()
        }));
        assert!(lines.contains(&OutputLine {
            stream: Stream::Stderr,
            text: "oops".to_string()
        }));
    }

    #[tokio::test]
    async fn test_stop_request_reaches_stdin() {
        let spec = CommandSpec::new("sh").args(["-c", "head -c 1 >/dev/null; exit 0"]);
        let mut process = TokioSpawner::new().spawn(&spec).await.unwrap();

        process.request_stop().await.unwrap();
        let exit = process.wait().await.unwrap();
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let spec = CommandSpec::new("/nonexistent/recdeck-ffmpeg");
        assert!(TokioSpawner::new().spawn(&spec).await.is_err());
    }
}
