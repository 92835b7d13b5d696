use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::types::AccessState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of a `probe_public` HEAD request: `{ok, status?, error?}`, never
/// blocking the caller past [`PROBE_TIMEOUT`].
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Round-tripper seam for `get`'s `probePublic` flag, so tests can supply a
/// fake instead of reaching the real tunnel edge — mirrors how
/// `process::ProcessLauncher` decouples `tunnel.rs` from a real subprocess.
#[async_trait]
pub trait PublicProbe: Send + Sync {
    async fn probe(&self, url: &str, access: &AccessState) -> ProbeOutcome;
}

/// `reqwest`-backed probe.
#[derive(Debug)]
pub struct RealPublicProbe {
    client: reqwest::Client,
}

impl Default for RealPublicProbe {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl PublicProbe for RealPublicProbe {
    async fn probe(&self, url: &str, access: &AccessState) -> ProbeOutcome {
        let mut builder = self.client.head(url);
        builder = match access.mode {
            crate::types::AccessMode::Token => match &access.token {
                Some(token) => builder.header("x-cfshare-token", token.clone()),
                None => builder,
            },
            crate::types::AccessMode::Basic => {
                match (&access.username, &access.password) {
                    (Some(user), Some(pass)) => builder.basic_auth(user, Some(pass)),
                    _ => builder,
                }
            }
            crate::types::AccessMode::None => builder,
        };

        match tokio::time::timeout(PROBE_TIMEOUT, builder.send()).await {
            Ok(Ok(resp)) => ProbeOutcome {
                ok: resp.status().is_success() || resp.status().is_redirection(),
                status: Some(resp.status().as_u16()),
                error: None,
            },
            Ok(Err(err)) => ProbeOutcome {
                ok: false,
                status: None,
                error: Some(err.to_string()),
            },
            Err(_) => ProbeOutcome {
                ok: false,
                status: None,
                error: Some("timed_out".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessMode;

    struct AlwaysUp;

    #[async_trait]
    impl PublicProbe for AlwaysUp {
        async fn probe(&self, _url: &str, _access: &AccessState) -> ProbeOutcome {
            ProbeOutcome {
                ok: true,
                status: Some(200),
                error: None,
            }
        }
    }

    fn access() -> AccessState {
        AccessState {
            mode: AccessMode::None,
            protect_origin: false,
            token: None,
            username: None,
            password: None,
            allowlist_paths: Vec::new(),
        }
    }

    #[tokio::test]
    async fn fake_probe_reports_reachable() {
        let probe = AlwaysUp;
        let outcome = probe.probe("https://example.trycloudflare.com", &access()).await;
        assert!(outcome.ok);
    }
}
