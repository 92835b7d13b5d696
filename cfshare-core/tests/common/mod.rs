#![allow(dead_code)]

use std::io;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use cfshare_core::clock::Clock;
use cfshare_core::clock::SystemClock;
use cfshare_core::http_client::ProbeOutcome;
use cfshare_core::http_client::PublicProbe;
use cfshare_core::process::ManagedChild;
use cfshare_core::process::ProcessLauncher;
use cfshare_core::types::AccessState;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;

/// A `ManagedChild` that immediately advertises a quick-tunnel URL on
/// stdout and otherwise sits idle until `kill`/`terminate_signal` is
/// called, standing in for a real `cloudflared` process in tests.
struct FakeTunnelChild {
    stdout: Option<Cursor<Vec<u8>>>,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl ManagedChild for FakeTunnelChild {
    fn pid(&self) -> Option<u32> {
        Some(424_242)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>> {
        self.stdout
            .take()
            .map(|c| Box::new(c) as Box<dyn AsyncRead + Unpin + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>> {
        None
    }

    async fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.killed.load(Ordering::SeqCst).then_some(0))
    }

    async fn wait(&mut self) -> io::Result<i32> {
        while !self.killed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(0)
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate_signal(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Spawns [`FakeTunnelChild`]s that report `https://fixture.trycloudflare.com`
/// as their readiness URL, standing in for the real tunnel binary so tests
/// don't need network access or an installed agent.
pub struct FakeLauncher {
    pub url: String,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            url: "https://fixture.trycloudflare.com".to_string(),
        }
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, _program: &str, _args: &[String]) -> io::Result<Box<dyn ManagedChild>> {
        Ok(Box::new(FakeTunnelChild {
            stdout: Some(Cursor::new(format!("{}\n", self.url).into_bytes())),
            killed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A launcher whose spawned child never emits a readiness line, so
/// `start_tunnel` exhausts its retries and returns `TunnelStartupFailure`.
pub struct SilentLauncher;

#[async_trait]
impl ProcessLauncher for SilentLauncher {
    async fn spawn(&self, _program: &str, _args: &[String]) -> io::Result<Box<dyn ManagedChild>> {
        Ok(Box::new(FakeTunnelChild {
            stdout: Some(Cursor::new(Vec::new())),
            killed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Always reports the probed URL as reachable, without making a real HTTP
/// request.
pub struct FakeProbe;

#[async_trait]
impl PublicProbe for FakeProbe {
    async fn probe(&self, _url: &str, _access: &AccessState) -> ProbeOutcome {
        ProbeOutcome {
            ok: true,
            status: Some(200),
            error: None,
        }
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Binds a local TCP listener and spawns a task that accepts (and drops)
/// every connection, so `probe_local_port` sees the port as alive.
pub async fn spawn_local_service() -> (u16, TcpListener) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind local service");
    let port = listener.local_addr().expect("local_addr").port();
    (port, listener)
}

pub fn accept_forever(listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });
}
