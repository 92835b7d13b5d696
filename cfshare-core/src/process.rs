use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Abstraction over spawning the tunnel agent, so tests can supply a fake
/// binary without a real `cloudflared` on PATH, rather than calling
/// `tokio::process::Command` directly from business logic.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ManagedChild>>;
}

#[async_trait]
pub trait ManagedChild: Send {
    fn pid(&self) -> Option<u32>;
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>>;
    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>>;
    async fn try_wait(&mut self) -> io::Result<Option<i32>>;
    async fn wait(&mut self) -> io::Result<i32>;
    async fn kill(&mut self) -> io::Result<()>;
    async fn terminate_signal(&mut self) -> io::Result<()>;
}

#[derive(Default)]
pub struct RealProcessLauncher;

#[async_trait]
impl ProcessLauncher for RealProcessLauncher {
    async fn spawn(&self, program: &str, args: &[String]) -> io::Result<Box<dyn ManagedChild>> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let child = command.spawn()?;
        Ok(Box::new(RealChild { child }))
    }
}

struct RealChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ManagedChild for RealChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>)
    }

    async fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(|s| s.code().unwrap_or(-1)))
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    #[cfg(unix)]
    async fn terminate_signal(&mut self) -> io::Result<()> {
        if let Some(pid) = self.pid() {
            // SAFETY: pid came from the child we spawned and is still owned by us.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn terminate_signal(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

const TERMINATE_GRACE: Duration = Duration::from_millis(2_500);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Send SIGTERM; if the child hasn't exited within 2.5s, send SIGKILL; wait
/// for exit. A no-op if the child is already gone.
pub async fn terminate_process(child: &mut dyn ManagedChild) {
    if matches!(child.try_wait().await, Ok(Some(_))) {
        return;
    }
    let _ = child.terminate_signal().await;
    let deadline = Instant::now() + TERMINATE_GRACE;
    loop {
        if matches!(child.try_wait().await, Ok(Some(_))) {
            return;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Generic line-buffered stream reader: emits complete lines split on `\n`
/// or `\r\n`, flushing any residue on EOF, and applies `on_line` exactly
/// once per line.
pub async fn read_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String) + Send,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(line),
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

/// Spawn a background task that forwards every line read from `reader`
/// through `tx`; the receiver end is typically fed into the session log.
pub fn spawn_line_forwarder<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        read_lines(reader, |line| {
            let _ = tx.send(line);
        })
        .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn splits_on_lf_and_crlf_and_flushes_residue() {
        let data = b"first\nsecond\r\nthird-no-newline".to_vec();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_line_forwarder(Cursor::new(data), tx);
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["first", "second", "third-no-newline"]);
    }
}
