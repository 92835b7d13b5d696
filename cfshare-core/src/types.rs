use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::FixedOffset;
use serde::Deserialize;
use serde::Serialize;

pub const MAX_LOG_ENTRIES: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Token,
    Basic,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeIpVersion {
    V4,
    V6,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelProtocol {
    Http2,
    Quic,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presentation {
    Preview,
    Download,
    Raw,
}

impl Default for Presentation {
    fn default() -> Self {
        Presentation::Preview
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesMode {
    Normal,
    Zip,
}

impl Default for FilesMode {
    fn default() -> Self {
        FilesMode::Normal
    }
}

/// A session's credentials. `token`/`password` are the live secrets; callers
/// presenting a session to the outside world must mask them (see
/// `access::mask_secret`), never serialize this struct directly onto the
/// wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessState {
    pub mode: AccessMode,
    pub protect_origin: bool,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub allowlist_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogComponent {
    Tunnel,
    Origin,
    Manager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<FixedOffset>,
    pub component: LogComponent,
    pub line: String,
}

/// Bounded ring buffer capped at [`MAX_LOG_ENTRIES`]; oldest entries drop first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRing(VecDeque<LogEntry>);

impl LogRing {
    pub fn push(&mut self, entry: LogEntry) {
        if self.0.len() >= MAX_LOG_ENTRIES {
            self.0.pop_front();
        }
        self.0.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last `n` entries matching `component` (or all, when `None`) whose
    /// timestamp is within `since_seconds` of `now` (or unfiltered, when
    /// `None`), newest last.
    pub fn query(
        &self,
        component: Option<LogComponent>,
        since_seconds: Option<i64>,
        now: DateTime<FixedOffset>,
        n: usize,
    ) -> Vec<LogEntry> {
        let filtered: Vec<&LogEntry> = self
            .0
            .iter()
            .filter(|e| component.is_none_or(|c| e.component == c))
            .filter(|e| {
                since_seconds.is_none_or(|secs| (now - e.ts).num_seconds() <= secs)
            })
            .collect();
        let start = filtered.len().saturating_sub(n);
        filtered[start..].iter().map(|e| (*e).clone()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub requests: u64,
    pub downloads: u64,
    pub bytes_sent: u64,
    pub last_access_at: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Error | SessionStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Port,
    Files,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Workspace-relative, POSIX-separated; never contains `..` or an
    /// absolute root (invariant checked by `util::is_sub_path`).
    pub name: String,
    pub size: u64,
    pub sha256: String,
    pub relative_url: String,
    pub modified_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub created_at: DateTime<FixedOffset>,
    pub expires_at: DateTime<FixedOffset>,
    pub ttl_seconds: u64,

    pub source_port: Option<u16>,
    pub origin_port: Option<u16>,

    pub workspace_dir: Option<PathBuf>,
    pub manifest: Vec<ManifestEntry>,
    pub files_mode: FilesMode,
    pub presentation: Presentation,

    pub access: AccessState,
    pub max_downloads: Option<u32>,

    pub public_url: Option<String>,
    pub local_url: Option<String>,

    pub stats: SessionStats,
    #[serde(skip)]
    pub logs: LogRing,

    pub last_error: Option<String>,
    pub process_pid: Option<u32>,
}

impl Session {
    pub fn is_port(&self) -> bool {
        matches!(self.kind, SessionKind::Port)
    }
}

/// The persisted subset of a [`Session`], written to `sessions.json` on
/// every lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub expires_at: DateTime<FixedOffset>,
    pub workspace_dir: Option<PathBuf>,
    pub process_pid: Option<u32>,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            kind: s.kind,
            status: s.status,
            expires_at: s.expires_at,
            workspace_dir: s.workspace_dir.clone(),
            process_pid: s.process_pid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<FixedOffset>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<SessionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
