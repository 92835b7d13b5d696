use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::FixedOffset;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::warn;

use crate::clock::Clock;
use crate::error::Result;
use crate::id::base36_millis;
use crate::types::AuditEvent;
use crate::types::SessionSnapshot;

const AUDIT_FILE: &str = "audit.jsonl";
const SESSIONS_FILE: &str = "sessions.json";
const DEFAULT_QUERY_LIMIT: usize = 500;
const MAX_QUERY_LIMIT: usize = 10_000;

enum AuditCmd {
    Append(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Append-only `audit.jsonl` writer, single-writer mpsc-actor style —
/// concurrent sessions never interleave partial JSON lines. Write failures
/// are logged, never propagated.
#[derive(Clone)]
pub struct AuditStore {
    tx: mpsc::UnboundedSender<AuditCmd>,
}

impl AuditStore {
    pub fn new(state_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditCmd>();
        tokio::spawn(async move {
            if let Err(err) = std::fs::create_dir_all(&state_dir) {
                warn!(error = %err, "failed to create state dir for audit log");
            }
            let path = state_dir.join(AUDIT_FILE);
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    AuditCmd::Append(event) => {
                        if let Err(err) = append_line(&path, &event) {
                            warn!(error = %err, "audit append failed");
                        }
                    }
                    AuditCmd::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn append(&self, event: AuditEvent) {
        let _ = self.tx.send(AuditCmd::Append(event));
    }

    /// Waits until every event enqueued before this call has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(AuditCmd::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

fn append_line(path: &Path, event: &AuditEvent) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(event)?;
    writeln!(file, "{line}")
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilters {
    pub event: Option<String>,
    pub id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}

/// Reads `audit.jsonl` line-by-line, silently skipping malformed lines,
/// applies `filters`, and returns the last `limit` matches in file order.
pub fn audit_query(state_dir: &Path, filters: &AuditFilters) -> Vec<AuditEvent> {
    let path = state_dir.join(AUDIT_FILE);
    let contents = std::fs::read_to_string(&path).unwrap_or_default();
    let limit = filters.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT);

    let matches: Vec<AuditEvent> = contents
        .lines()
        .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
        .filter(|event| matches_filters(event, filters))
        .collect();

    let start = matches.len().saturating_sub(limit);
    matches[start..].to_vec()
}

fn matches_filters(event: &AuditEvent, filters: &AuditFilters) -> bool {
    if let Some(want) = &filters.event {
        if &event.event != want {
            return false;
        }
    }
    if let Some(want) = &filters.id {
        if event.id.as_deref() != Some(want.as_str()) {
            return false;
        }
    }
    let ts = event.ts.to_rfc3339();
    if let Some(since) = &filters.since {
        if !compare_timestamps(&ts, since, false) {
            return false;
        }
    }
    if let Some(until) = &filters.until {
        if !compare_timestamps(&ts, until, true) {
            return false;
        }
    }
    true
}

/// `ts >= bound` (is_upper=false) or `ts <= bound` (is_upper=true). Prefers
/// numeric comparison when both parse as timestamps; falls back to lexical
/// comparison, which is safe since ISO-8601-with-fixed-offset sorts
/// lexicographically.
fn compare_timestamps(ts: &str, bound: &str, is_upper: bool) -> bool {
    let numeric = DateTime::parse_from_rfc3339(ts)
        .ok()
        .zip(DateTime::parse_from_rfc3339(bound).ok());
    match numeric {
        Some((ts, bound)) => {
            if is_upper {
                ts <= bound
            } else {
                ts >= bound
            }
        }
        None => {
            if is_upper {
                ts <= bound
            } else {
                ts >= bound
            }
        }
    }
}

/// Runs `audit_query` with the maximum limit and writes the result as JSONL
/// to `output_path` (default `<state>/exports/audit-<base36-ms>.jsonl`),
/// recording an `audit_exported` event.
pub fn audit_export(
    state_dir: &Path,
    filters: &AuditFilters,
    output_path: Option<PathBuf>,
    clock: &dyn Clock,
    store: &AuditStore,
) -> Result<PathBuf> {
    let mut export_filters = filters.clone();
    export_filters.limit = Some(MAX_QUERY_LIMIT);
    let events = audit_query(state_dir, &export_filters);

    let destination = output_path.unwrap_or_else(|| {
        state_dir
            .join("exports")
            .join(format!("audit-{}.jsonl", base36_millis(clock)))
    });
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = String::new();
    for event in &events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    std::fs::write(&destination, out)?;

    store.append(AuditEvent {
        ts: clock.now(),
        event: "audit_exported".to_string(),
        id: None,
        kind: None,
        details: Some(serde_json::json!({"output_path": destination, "count": events.len()})),
    });

    Ok(destination)
}

/// Atomically replaces `sessions.json` with the current live table via a
/// temp-file-then-rename.
pub fn write_snapshot(state_dir: &Path, sessions: &[SessionSnapshot]) -> std::io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join(SESSIONS_FILE);
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(sessions)?;
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, &path)
}

pub fn read_snapshot(state_dir: &Path) -> Vec<SessionSnapshot> {
    let path = state_dir.join(SESSIONS_FILE);
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use chrono::DateTime as ChronoDateTime;
    use tempfile::tempdir;

    fn event(ts: &str, kind: &str) -> AuditEvent {
        AuditEvent {
            ts: ChronoDateTime::parse_from_rfc3339(ts).expect("fixed ts"),
            event: kind.to_string(),
            id: Some("sess_1".to_string()),
            kind: None,
            details: None,
        }
    }

    #[tokio::test]
    async fn append_then_query_round_trips() {
        let dir = tempdir().expect("dir");
        let store = AuditStore::new(dir.path().to_path_buf());
        store.append(event("2026-01-01T00:00:00+00:00", "exposure_started"));
        store.append(event("2026-01-01T00:01:00+00:00", "exposure_stopped"));
        store.flush().await;

        let results = audit_query(dir.path(), &AuditFilters::default());
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn query_filters_by_event_kind() {
        let dir = tempdir().expect("dir");
        let store = AuditStore::new(dir.path().to_path_buf());
        store.append(event("2026-01-01T00:00:00+00:00", "exposure_started"));
        store.append(event("2026-01-01T00:01:00+00:00", "exposure_stopped"));
        store.flush().await;

        let filters = AuditFilters {
            event: Some("exposure_stopped".to_string()),
            ..Default::default()
        };
        let results = audit_query(dir.path(), &filters);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event, "exposure_stopped");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().expect("dir");
        std::fs::write(
            dir.path().join(AUDIT_FILE),
            "{not json}\n{\"ts\":\"2026-01-01T00:00:00+00:00\",\"event\":\"gc_run\"}\n",
        )
        .expect("write");
        let results = audit_query(dir.path(), &AuditFilters::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event, "gc_run");
    }

    #[test]
    fn snapshot_round_trips_through_atomic_rename() {
        let dir = tempdir().expect("dir");
        let clock = SystemClock;
        let snapshot = SessionSnapshot {
            id: "sess_1".to_string(),
            kind: crate::types::SessionKind::Port,
            status: crate::types::SessionStatus::Running,
            expires_at: clock.now(),
            workspace_dir: None,
            process_pid: Some(123),
        };
        write_snapshot(dir.path(), &[snapshot]).expect("write");
        let loaded = read_snapshot(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "sess_1");
    }
}
