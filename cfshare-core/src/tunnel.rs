use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use crate::error::CfshareError;
use crate::error::Result;
use crate::process::ManagedChild;
use crate::process::ProcessLauncher;
use crate::process::spawn_line_forwarder;
use crate::process::terminate_process;
use crate::types::EdgeIpVersion;
use crate::types::TunnelProtocol;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_ATTEMPTS: u32 = 2;
const SUBDOMAIN_BLACKLIST: &[&str] = &["api"];

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub binary: String,
    pub target_port: u16,
    pub edge_ip_version: EdgeIpVersion,
    pub protocol: TunnelProtocol,
    pub retry_attempts: u32,
}

impl TunnelConfig {
    pub fn new(binary: String, target_port: u16, edge_ip_version: EdgeIpVersion, protocol: TunnelProtocol) -> Self {
        Self {
            binary,
            target_port,
            edge_ip_version,
            protocol,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }

    /// The tunnel agent's CLI contract.
    pub fn args(&self) -> Vec<String> {
        let edge = match self.edge_ip_version {
            EdgeIpVersion::V4 => "4",
            EdgeIpVersion::V6 => "6",
            EdgeIpVersion::Auto => "auto",
        };
        let proto = match self.protocol {
            TunnelProtocol::Http2 => "http2",
            TunnelProtocol::Quic => "quic",
            TunnelProtocol::Auto => "auto",
        };
        vec![
            "tunnel".to_string(),
            "--url".to_string(),
            format!("http://127.0.0.1:{}", self.target_port),
            "--edge-ip-version".to_string(),
            edge.to_string(),
            "--protocol".to_string(),
            proto.to_string(),
            "--no-autoupdate".to_string(),
        ]
    }
}

pub struct TunnelHandle {
    child: Box<dyn ManagedChild>,
}

impl TunnelHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.pid()
    }

    /// Non-blocking exit check; the session manager polls this alongside
    /// its TTL timer so a child-exit termination source is just another
    /// condition observed by the same reaper-style loop, rather than a
    /// second concurrent watcher racing to own the child.
    pub async fn exited(&mut self) -> Option<i32> {
        self.child.try_wait().await.ok().flatten()
    }

    pub async fn terminate(mut self) {
        terminate_process(self.child.as_mut()).await;
    }

    /// Await the child's own exit, for the session supervisor's
    /// child-exit termination source. Never returns while the child is
    /// healthy.
    pub async fn wait_exit(&mut self) -> i32 {
        self.child.wait().await.unwrap_or(-1)
    }
}

fn readiness_regex() -> Regex {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"https://([a-zA-Z0-9-]+)\.trycloudflare\.com").unwrap()
}

/// Scan a line for the first valid quick-tunnel URL. A subdomain is valid
/// iff it is a single label of `[A-Za-z0-9-]+` not on the blacklist.
pub fn extract_ready_url(line: &str, re: &Regex) -> Option<String> {
    let caps = re.captures(line)?;
    let subdomain = caps.get(1)?.as_str();
    if SUBDOMAIN_BLACKLIST.contains(&subdomain.to_ascii_lowercase().as_str()) {
        return None;
    }
    Some(caps.get(0)?.as_str().to_string())
}

/// Spawn the tunnel agent, scan its stdout/stderr for a readiness URL
/// within a 30s global timeout, and forward every line to `on_line`
/// (typically appended to the session log under component `tunnel`).
///
/// Wrapped in a bounded retry (default 2 attempts); between attempts the
/// previous child, if any, is terminated.
pub async fn start_tunnel<F>(
    launcher: Arc<dyn ProcessLauncher>,
    config: &TunnelConfig,
    mut on_line: F,
) -> Result<(TunnelHandle, String)>
where
    F: FnMut(String) + Send + Clone + 'static,
{
    let attempts = config.retry_attempts.max(1);
    let mut last_err: Option<CfshareError> = None;

    for attempt in 1..=attempts {
        match try_once(launcher.clone(), config, on_line.clone()).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                warn!(attempt, error = %err, "tunnel start attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or(CfshareError::TunnelStartupFailure(
        "unknown tunnel failure".to_string(),
    )))
}

async fn try_once<F>(
    launcher: Arc<dyn ProcessLauncher>,
    config: &TunnelConfig,
    mut on_line: F,
) -> Result<(TunnelHandle, String)>
where
    F: FnMut(String) + Send + Clone + 'static,
{
    let mut child = launcher
        .spawn(&config.binary, &config.args())
        .await
        .map_err(|e| CfshareError::AgentNotFound(format!("{}: {e}", config.binary)))?;

    let stdout = child.take_stdout();
    let stderr = child.take_stderr();

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = stdout {
        spawn_line_forwarder(stdout, line_tx.clone());
    }
    if let Some(stderr) = stderr {
        spawn_line_forwarder(stderr, line_tx);
    }

    let re = readiness_regex();
    let wait_for_url = async {
        while let Some(line) = line_rx.recv().await {
            on_line(line.clone());
            if let Some(url) = extract_ready_url(&line, &re) {
                return Some(url);
            }
        }
        None
    };

    let url = match timeout(READY_TIMEOUT, wait_for_url).await {
        Ok(Some(url)) => url,
        Ok(None) => {
            terminate_process(child.as_mut()).await;
            return Err(CfshareError::TunnelStartupFailure(
                "agent exited before emitting a URL".to_string(),
            ));
        }
        Err(_) => {
            terminate_process(child.as_mut()).await;
            return Err(CfshareError::TunnelStartupFailure(
                "timed_out_waiting_for_url".to_string(),
            ));
        }
    };

    tokio::spawn(async move {
        // Drain remaining lines so the forwarder tasks don't block on a full channel.
        while line_rx.recv().await.is_some() {}
    });

    Ok((TunnelHandle { child }, url))
}

/// Parse a tunnel agent's `--version` output for a semver string
/// (`version\s+(\d+\.\d+\.\d+)`).
pub fn parse_version(output: &str) -> Option<String> {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"version\s+(\d+\.\d+\.\d+)").unwrap();
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_valid_subdomain() {
        let re = readiness_regex();
        let line = "INF |  https://random-words-here.trycloudflare.com                         |";
        assert_eq!(
            extract_ready_url(line, &re),
            Some("https://random-words-here.trycloudflare.com".to_string())
        );
    }

    #[test]
    fn rejects_blacklisted_subdomain() {
        let re = readiness_regex();
        let line = "https://api.trycloudflare.com";
        assert_eq!(extract_ready_url(line, &re), None);
    }

    #[test]
    fn ignores_non_matching_lines() {
        let re = readiness_regex();
        assert_eq!(extract_ready_url("starting tunnel...", &re), None);
    }

    #[test]
    fn parses_semver_from_version_output() {
        let out = "cloudflared version 2024.6.1 (built ...)";
        assert_eq!(parse_version(out), Some("2024.6.1".to_string()));
    }
}
