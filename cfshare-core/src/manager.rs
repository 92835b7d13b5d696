use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration as ChronoDuration;
use chrono::FixedOffset;
use serde_json::Value;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::info;
use tracing::warn;

use crate::access;
use crate::audit;
use crate::audit::AuditFilters;
use crate::audit::AuditStore;
use crate::clock::Clock;
use crate::error::CfshareError;
use crate::error::Result;
use crate::http_client::ProbeOutcome;
use crate::http_client::PublicProbe;
use crate::id::new_session_id;
use crate::origin_host::OriginHost;
use crate::policy;
use crate::policy::IgnoreMatcher;
use crate::policy::Policy;
use crate::process::ProcessLauncher;
use crate::proxy;
use crate::proxy::ReverseProxy;
use crate::ratelimit::RateLimiter;
use crate::static_origin;
use crate::static_origin::StaticOrigin;
use crate::static_origin::manifest::build_manifest;
use crate::static_origin::workspace::build_workspace;
use crate::static_origin::zip_bundle::build_bundle_entry;
use crate::tunnel;
use crate::tunnel::TunnelConfig;
use crate::tunnel::TunnelHandle;
use crate::types::AccessMode;
use crate::types::AccessState;
use crate::types::FilesMode;
use crate::types::LogComponent;
use crate::types::LogEntry;
use crate::types::ManifestEntry;
use crate::types::Presentation;
use crate::types::Session;
use crate::types::SessionKind;
use crate::types::SessionSnapshot;
use crate::types::SessionStats;
use crate::types::SessionStatus;

const DEFAULT_TUNNEL_BINARY: &str = "cloudflared";
const REAPER_INTERVAL: Duration = Duration::from_secs(30);
const MANIFEST_CAP_SINGLE: usize = 200;
const MANIFEST_CAP_MULTI: usize = 20;
const SELECTION_CAP: usize = 200;

/// Everything the adapter needs to supply per `expose_port` call; the
/// optional fields fall back to policy defaults.
#[derive(Debug, Clone, Default)]
pub struct ExposePortRequest {
    pub port: u16,
    pub access: Option<AccessMode>,
    pub ttl_seconds: Option<u64>,
    pub protect_origin: Option<bool>,
    pub allowlist_paths: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExposeFilesRequest {
    pub paths: Vec<PathBuf>,
    pub access: Option<AccessMode>,
    pub ttl_seconds: Option<u64>,
    pub protect_origin: Option<bool>,
    pub allowlist_paths: Vec<String>,
    pub mode: Option<FilesMode>,
    pub presentation: Option<Presentation>,
    pub max_downloads: Option<u32>,
    pub title: Option<String>,
}

/// Input shape for `get`: single id, a list (either may contain the
/// `"all"` sentinel), or a filter over status/kind.
#[derive(Debug, Clone)]
pub enum GetSelector {
    Id(String),
    Ids(Vec<String>),
    Filter(GetFilter),
}

#[derive(Debug, Clone, Default)]
pub struct GetFilter {
    pub status: Option<SessionStatus>,
    pub kind: Option<SessionKind>,
}

#[derive(Debug, Clone)]
pub struct GetRequest {
    pub selector: GetSelector,
    pub fields: Option<Vec<String>>,
    pub probe_public: bool,
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub sessions: Vec<Value>,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub enum StopTargets {
    Id(String),
    Ids(Vec<String>),
    All,
}

#[derive(Debug, Clone, Default)]
pub struct StopResult {
    pub stopped: Vec<String>,
    pub failed: Vec<StopFailure>,
    pub cleaned: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StopFailure {
    pub id: String,
    pub error: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct GcResult {
    pub removed_workspaces: Vec<PathBuf>,
    pub terminated_pids: Vec<u32>,
}

/// Collaborators an [`ExposureManager`] is constructed with, so tests can
/// inject a fake clock, a fake subprocess launcher and a fake HTTP
/// round-tripper instead of touching the real world.
pub struct ManagerDeps {
    pub state_dir: PathBuf,
    pub cwd: PathBuf,
    pub clock: Arc<dyn Clock>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub probe: Arc<dyn PublicProbe>,
    pub tunnel_binary: String,
}

impl ManagerDeps {
    pub fn new(
        state_dir: PathBuf,
        cwd: PathBuf,
        clock: Arc<dyn Clock>,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn PublicProbe>,
    ) -> Self {
        Self {
            state_dir,
            cwd,
            clock,
            launcher,
            probe,
            tunnel_binary: DEFAULT_TUNNEL_BINARY.to_string(),
        }
    }
}

enum StopReason {
    User,
    Expired,
    ChildExit(i32),
    Quota(&'static str),
}

struct StopCmd {
    reason: StopReason,
    reply: Option<oneshot::Sender<StopOutcome>>,
}

struct StopOutcome {
    workspace_removed: Option<PathBuf>,
}

/// One live session's shared, synchronously-lockable data plus the channel
/// used to ask its supervisor task to terminate it.
struct SessionHandle {
    id: String,
    data: Arc<StdMutex<Session>>,
    stop_tx: mpsc::UnboundedSender<StopCmd>,
}

enum OriginResources {
    Proxy(ReverseProxy),
    Static(StaticOrigin),
    None,
}

struct Inner {
    state_dir: PathBuf,
    workspaces_dir: PathBuf,
    policy_path: PathBuf,
    ignore_path: Option<PathBuf>,
    cwd: PathBuf,
    clock: Arc<dyn Clock>,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn PublicProbe>,
    audit: AuditStore,
    tunnel_binary: String,
    policy: RwLock<Policy>,
    ignore_matcher: RwLock<Arc<IgnoreMatcher>>,
    sessions: RwLock<std::collections::HashMap<String, Arc<SessionHandle>>>,
}

/// The in-process scheduler, state machine and protocol glue owning the
/// lifecycle of every exposure session: the session table and
/// bring-up/stop/get/logs/maintenance operations the adapter calls, wiring
/// in policy, access/rate-limiting, the origin servers and the tunnel
/// supervisor.
#[derive(Clone)]
pub struct ExposureManager {
    inner: Arc<Inner>,
}

impl ExposureManager {
    pub fn new(deps: ManagerDeps) -> Self {
        let policy_path = deps.state_dir.join("policy.json");
        let ignore_path = deps.state_dir.join("policy.ignore");
        let ignore_path = ignore_path.is_file().then_some(ignore_path);
        let loaded = policy::load(&policy_path, ignore_path.as_deref(), &deps.cwd);
        if !loaded.warnings.is_empty() {
            warn!(warnings = ?loaded.warnings, "policy load produced warnings");
        }

        let inner = Arc::new(Inner {
            workspaces_dir: deps.state_dir.join("workspaces"),
            audit: AuditStore::new(deps.state_dir.clone()),
            policy_path,
            ignore_path,
            state_dir: deps.state_dir,
            cwd: deps.cwd,
            clock: deps.clock,
            launcher: deps.launcher,
            probe: deps.probe,
            tunnel_binary: deps.tunnel_binary,
            policy: RwLock::new(loaded.policy),
            ignore_matcher: RwLock::new(Arc::new(loaded.ignore_matcher)),
            sessions: RwLock::new(std::collections::HashMap::new()),
        });

        spawn_reaper(inner.clone());
        Self { inner }
    }

    /// Reports whether the configured tunnel binary is resolvable, without
    /// starting any session.
    pub async fn env_check(&self) -> Value {
        let binary = self.inner.tunnel_binary.clone();
        let resolvable = which_on_path(&binary).is_some() || Path::new(&binary).is_file();
        json!({"tunnel_binary": binary, "resolvable": resolvable})
    }

    pub async fn policy(&self) -> Policy {
        self.inner.policy.read().await.clone()
    }

    pub async fn read_raw_policy(&self) -> Value {
        policy::read_raw(&self.inner.policy_path)
    }

    /// Merges `patch` into the on-disk policy and reloads the effective
    /// policy, recording a `policy_updated` audit event.
    pub async fn update_policy(&self, patch: &Value) -> Result<(Policy, Vec<String>)> {
        let merged_raw = policy::write_merged(&self.inner.policy_path, patch)?;
        let mut warnings = Vec::new();
        let new_policy = policy::apply_patch(&Policy::default(), &merged_raw, &mut warnings);
        *self.inner.policy.write().await = new_policy.clone();

        self.inner.audit.append(crate::types::AuditEvent {
            ts: self.inner.clock.now(),
            event: "policy_updated".to_string(),
            id: None,
            kind: None,
            details: Some(json!({"warnings": warnings})),
        });

        Ok((new_policy, warnings))
    }

    /// Applies `patch` as the process-wide config-struct tier from spec
    /// §3's precedence (on-disk policy JSON, then this, then built-in
    /// defaults): recomputed in memory for this `ExposureManager` instance
    /// only. Never touches `policy.json` and never records a
    /// `policy_updated` audit event — that stays exclusive to
    /// [`update_policy`]'s explicit, persisted patch.
    pub async fn apply_runtime_config(&self, patch: &Value) -> Result<(Policy, Vec<String>)> {
        let mut warnings = Vec::new();
        let defaults_raw =
            serde_json::to_value(Policy::default()).unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        let config_tier = policy::merge_policy(&defaults_raw, patch, &mut warnings);
        let on_disk_raw = policy::read_raw(&self.inner.policy_path);
        let merged_raw = policy::merge_policy(&config_tier, &on_disk_raw, &mut warnings);
        let new_policy = policy::apply_patch(&Policy::default(), &merged_raw, &mut warnings);
        *self.inner.policy.write().await = new_policy.clone();
        Ok((new_policy, warnings))
    }

    pub async fn expose_port(&self, req: ExposePortRequest) -> Result<Value> {
        if req.port == 0 {
            return Err(CfshareError::InvalidInput(
                "port must be in 1..=65535".to_string(),
            ));
        }

        let policy = self.inner.policy.read().await.clone();
        if policy.is_port_blocked(req.port) {
            return Err(CfshareError::PolicyViolation(format!(
                "port blocked by policy: {}",
                req.port
            )));
        }
        if !crate::util::ports::probe_local_port(req.port).await {
            return Err(CfshareError::LocalUnreachable(req.port));
        }

        let now = self.inner.clock.now();
        let ttl = policy.clamp_ttl(req.ttl_seconds.unwrap_or(policy.default_ttl_seconds));
        let expires_at = now + ChronoDuration::seconds(ttl as i64);
        let access_mode = req.access.unwrap_or(policy.default_expose_port_access);
        let protect_origin = req
            .protect_origin
            .unwrap_or(access_mode != AccessMode::None);
        let access = build_access_state(access_mode, protect_origin, req.allowlist_paths.clone());

        let id = new_session_id("port", self.inner.clock.as_ref());
        let session = Session {
            id: id.clone(),
            kind: SessionKind::Port,
            status: SessionStatus::Starting,
            created_at: now,
            expires_at,
            ttl_seconds: ttl,
            source_port: Some(req.port),
            origin_port: None,
            workspace_dir: None,
            manifest: Vec::new(),
            files_mode: FilesMode::Normal,
            presentation: Presentation::Preview,
            access,
            max_downloads: None,
            public_url: None,
            local_url: None,
            stats: SessionStats::default(),
            logs: Default::default(),
            last_error: None,
            process_pid: None,
        };

        let (handle, stop_rx) = self.register_session(session).await;
        let data = handle.data.clone();

        let need_proxy = {
            let guard = lock(&data);
            guard.access.protect_origin
                || !guard.access.allowlist_paths.is_empty()
                || policy.rate_limit.enabled
        };

        let bring_up = async {
            let (target_port, origin) = if need_proxy {
                let proxy_port = crate::util::ports::find_free_port().await?;
                lock(&data).origin_port = Some(proxy_port);
                let host = self.session_origin_host(&handle, &policy);
                let proxy = proxy::start_reverse_proxy(
                    socket_addr(proxy_port),
                    req.port,
                    host,
                )
                .await?;
                (proxy_port, OriginResources::Proxy(proxy))
            } else {
                (req.port, OriginResources::None)
            };

            let (tunnel_handle, url) = self.start_tunnel(target_port, &policy, &data).await?;
            Ok::<_, CfshareError>((tunnel_handle, url, origin))
        };

        self.finish_bring_up(id, handle, data, expires_at, stop_rx, bring_up, now, SessionKind::Port)
            .await
    }

    pub async fn expose_files(&self, req: ExposeFilesRequest) -> Result<Value> {
        if req.paths.is_empty() {
            return Err(CfshareError::InvalidInput(
                "expose_files requires at least one path".to_string(),
            ));
        }

        let policy = self.inner.policy.read().await.clone();
        let ignore_matcher = self.inner.ignore_matcher.read().await.clone();

        let now = self.inner.clock.now();
        let ttl = policy.clamp_ttl(req.ttl_seconds.unwrap_or(policy.default_ttl_seconds));
        let expires_at = now + ChronoDuration::seconds(ttl as i64);
        let access_mode = req.access.unwrap_or(policy.default_expose_files_access);
        let protect_origin = req
            .protect_origin
            .unwrap_or(access_mode != AccessMode::None);
        let access = build_access_state(access_mode, protect_origin, req.allowlist_paths.clone());
        let files_mode = req.mode.unwrap_or_default();
        let presentation = req.presentation.unwrap_or_default();

        let id = new_session_id("files", self.inner.clock.as_ref());
        let workspace_dir = self.inner.workspaces_dir.join(&id);

        let session = Session {
            id: id.clone(),
            kind: SessionKind::Files,
            status: SessionStatus::Starting,
            created_at: now,
            expires_at,
            ttl_seconds: ttl,
            source_port: None,
            origin_port: None,
            workspace_dir: Some(workspace_dir.clone()),
            manifest: Vec::new(),
            files_mode,
            presentation,
            access,
            max_downloads: req.max_downloads,
            public_url: None,
            local_url: None,
            stats: SessionStats::default(),
            logs: Default::default(),
            last_error: None,
            process_pid: None,
        };

        let (handle, stop_rx) = self.register_session(session).await;
        let data = handle.data.clone();
        let cwd = self.inner.cwd.clone();
        let clock = self.inner.clock.clone();
        let title = req.title.clone().unwrap_or_else(|| id.clone());

        let bring_up = async {
            build_workspace(&req.paths, &workspace_dir, &cwd, &ignore_matcher, &policy)?;

            let mut manifest = build_manifest(&workspace_dir, clock.as_ref())?;
            if files_mode == FilesMode::Zip {
                let bundle_entry = build_bundle_entry(&workspace_dir, &manifest, clock.as_ref())?;
                manifest.push(bundle_entry);
            }
            lock(&data).manifest = manifest.clone();

            let origin_port = crate::util::ports::find_free_port().await?;
            let host = self.session_origin_host(&handle, &policy);
            let origin = static_origin::start_static_origin(
                socket_addr(origin_port),
                workspace_dir.clone(),
                manifest,
                files_mode,
                presentation,
                title.clone(),
                host,
            )
            .await?;
            lock(&data).local_url = Some(format!("http://127.0.0.1:{origin_port}"));

            let (tunnel_handle, url) = self.start_tunnel(origin_port, &policy, &data).await?;
            Ok::<_, CfshareError>((tunnel_handle, url, OriginResources::Static(origin)))
        };

        match self
            .finish_bring_up(
                id.clone(),
                handle,
                data,
                expires_at,
                stop_rx,
                bring_up,
                now,
                SessionKind::Files,
            )
            .await
        {
            Ok(value) => Ok(value),
            Err(err) => {
                let _ = std::fs::remove_dir_all(&workspace_dir);
                Err(err)
            }
        }
    }

    async fn register_session(
        &self,
        session: Session,
    ) -> (Arc<SessionHandle>, mpsc::UnboundedReceiver<StopCmd>) {
        let id = session.id.clone();
        let data = Arc::new(StdMutex::new(session));
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            data,
            stop_tx,
        });
        self.inner
            .sessions
            .write()
            .await
            .insert(id, handle.clone());
        (handle, stop_rx)
    }

    fn session_origin_host(&self, handle: &Arc<SessionHandle>, policy: &Policy) -> Arc<dyn OriginHost> {
        Arc::new(SessionOriginHost {
            data: handle.data.clone(),
            rate_limiter: Arc::new(RateLimiter::new(policy.rate_limit.clone())),
            stop_tx: handle.stop_tx.clone(),
            clock: self.inner.clock.clone(),
        })
    }

    async fn start_tunnel(
        &self,
        target_port: u16,
        policy: &Policy,
        data: &Arc<StdMutex<Session>>,
    ) -> Result<(TunnelHandle, String)> {
        let config = TunnelConfig::new(
            self.inner.tunnel_binary.clone(),
            target_port,
            policy.tunnel.edge_ip_version,
            policy.tunnel.protocol,
        );
        let clock = self.inner.clock.clone();
        let log_data = data.clone();
        tunnel::start_tunnel(self.inner.launcher.clone(), &config, move |line| {
            lock(&log_data).logs.push(LogEntry {
                ts: clock.now(),
                component: LogComponent::Tunnel,
                line,
            });
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_bring_up<F>(
        &self,
        id: String,
        handle: Arc<SessionHandle>,
        data: Arc<StdMutex<Session>>,
        expires_at: DateTime<FixedOffset>,
        stop_rx: mpsc::UnboundedReceiver<StopCmd>,
        bring_up: F,
        started_at: DateTime<FixedOffset>,
        kind: SessionKind,
    ) -> Result<Value>
    where
        F: std::future::Future<Output = Result<(TunnelHandle, String, OriginResources)>>,
    {
        match bring_up.await {
            Ok((tunnel_handle, url, origin)) => {
                let pid = tunnel_handle.pid();
                {
                    let mut guard = lock(&data);
                    guard.status = SessionStatus::Running;
                    guard.public_url = Some(url);
                    guard.process_pid = pid;
                }

                let sleep_duration = (expires_at - self.inner.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                tokio::spawn(run_supervisor(
                    self.inner.clone(),
                    id.clone(),
                    data.clone(),
                    tunnel_handle,
                    origin,
                    sleep_duration,
                    stop_rx,
                ));

                self.inner.audit.append(crate::types::AuditEvent {
                    ts: started_at,
                    event: "exposure_started".to_string(),
                    id: Some(id),
                    kind: Some(kind),
                    details: None,
                });
                self.persist_snapshot().await;

                Ok(session_to_value(&lock(&data), MANIFEST_CAP_SINGLE))
            }
            Err(err) => {
                self.inner.sessions.write().await.remove(&id);
                info!(id = %id, error = %err, "exposure bring-up failed");
                Err(err)
            }
        }
    }

    async fn persist_snapshot(&self) {
        let sessions = self.inner.sessions.read().await;
        let snapshot: Vec<SessionSnapshot> =
            sessions.values().map(|h| SessionSnapshot::from(&*lock(&h.data))).collect();
        drop(sessions);
        if let Err(err) = audit::write_snapshot(&self.inner.state_dir, &snapshot) {
            warn!(error = %err, "failed to persist session snapshot");
        }
    }

    /// Accepts a single id, a list, or `all`.
    pub async fn stop(&self, targets: StopTargets) -> StopResult {
        let ids = match targets {
            StopTargets::Id(id) => vec![id],
            StopTargets::Ids(ids) => ids,
            StopTargets::All => self.inner.sessions.read().await.keys().cloned().collect(),
        };

        let mut result = StopResult::default();
        for id in ids {
            match self.stop_one(&id, StopReason::User).await {
                Ok(outcome) => {
                    result.stopped.push(id);
                    if let Some(path) = outcome.workspace_removed {
                        result.cleaned.push(path);
                    }
                }
                Err(_) => result.failed.push(StopFailure {
                    id,
                    error: "not_found",
                }),
            }
        }
        result
    }

    async fn stop_one(&self, id: &str, reason: StopReason) -> Result<StopOutcome> {
        let handle = self.inner.sessions.read().await.get(id).cloned();
        let Some(handle) = handle else {
            return Err(CfshareError::NotFound);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .stop_tx
            .send(StopCmd {
                reason,
                reply: Some(reply_tx),
            })
            .map_err(|_| CfshareError::NotFound)?;
        reply_rx.await.map_err(|_| CfshareError::NotFound)
    }

    /// Last `n` log entries for a session, filtered by component/recency.
    pub async fn logs(
        &self,
        id: &str,
        component: Option<LogComponent>,
        since_seconds: Option<i64>,
        n: usize,
    ) -> Result<Vec<LogEntry>> {
        let handle = self
            .inner
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(CfshareError::NotFound)?;
        let n = n.clamp(1, 1000);
        let now = self.inner.clock.now();
        let guard = lock(&handle.data);
        Ok(guard.logs.query(component, since_seconds, now, n))
    }

    /// Three input shapes, field projection, manifest pagination and an
    /// optional `probe_public` round trip.
    pub async fn get(&self, req: GetRequest) -> Result<GetResponse> {
        let all: Vec<Arc<SessionHandle>> =
            self.inner.sessions.read().await.values().cloned().collect();

        let (mut matched, is_multi) = match &req.selector {
            GetSelector::Id(id) if id == "all" => (all, true),
            GetSelector::Id(id) => {
                let found = all.into_iter().find(|h| &h.id == id);
                match found {
                    Some(h) => (vec![h], false),
                    None => return Err(CfshareError::NotFound),
                }
            }
            GetSelector::Ids(ids) => {
                if ids.iter().any(|i| i == "all") {
                    (all, true)
                } else {
                    let set: HashSet<&String> = ids.iter().collect();
                    (
                        all.into_iter().filter(|h| set.contains(&h.id)).collect(),
                        true,
                    )
                }
            }
            GetSelector::Filter(filter) => {
                let filtered = all
                    .into_iter()
                    .filter(|h| {
                        let guard = lock(&h.data);
                        filter.status.is_none_or(|s| guard.status == s)
                            && filter.kind.is_none_or(|k| guard.kind == k)
                    })
                    .collect();
                (filtered, true)
            }
        };

        matched.sort_by(|a, b| a.id.cmp(&b.id));
        let truncated = matched.len() > SELECTION_CAP;
        matched.truncate(SELECTION_CAP);
        let manifest_cap = if is_multi { MANIFEST_CAP_MULTI } else { MANIFEST_CAP_SINGLE };

        let mut sessions = Vec::with_capacity(matched.len());
        for handle in &matched {
            let mut value = session_to_value(&lock(&handle.data), manifest_cap);
            if req.probe_public {
                let probe = self.probe_one(handle).await;
                value["public_probe"] = serde_json::to_value(probe).unwrap_or(Value::Null);
            }
            if let Some(fields) = &req.fields {
                value = project_fields(value, fields);
            }
            sessions.push(value);
        }

        Ok(GetResponse { sessions, truncated })
    }

    async fn probe_one(&self, handle: &Arc<SessionHandle>) -> ProbeOutcome {
        let (url, access) = {
            let guard = lock(&handle.data);
            (guard.public_url.clone(), guard.access.clone())
        };
        let Some(url) = url else {
            return ProbeOutcome {
                ok: false,
                status: None,
                error: Some("no_public_url".to_string()),
            };
        };
        self.inner.probe.probe(&url, &access).await
    }

    /// Query the audit log with filters.
    pub fn audit_query(&self, filters: &AuditFilters) -> Vec<crate::types::AuditEvent> {
        audit::audit_query(&self.inner.state_dir, filters)
    }

    /// Export a filtered slice of the audit log to a JSONL file.
    pub fn audit_export(
        &self,
        filters: &AuditFilters,
        output_path: Option<PathBuf>,
    ) -> Result<PathBuf> {
        audit::audit_export(
            &self.inner.state_dir,
            filters,
            output_path,
            self.inner.clock.as_ref(),
            &self.inner.audit,
        )
    }

    /// Orphaned workspace cleanup and best-effort termination of
    /// snapshot-recorded PIDs no longer live.
    pub async fn run_gc(&self) -> GcResult {
        let live_ids: HashSet<String> =
            self.inner.sessions.read().await.keys().cloned().collect();

        let mut removed_workspaces = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.inner.workspaces_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if path.is_dir() && !live_ids.contains(name) && std::fs::remove_dir_all(&path).is_ok() {
                    removed_workspaces.push(path);
                }
            }
        }

        let mut terminated_pids = Vec::new();
        for snapshot in audit::read_snapshot(&self.inner.state_dir) {
            if live_ids.contains(&snapshot.id) {
                continue;
            }
            if let Some(pid) = snapshot.process_pid {
                if signal_pid_if_alive(pid) {
                    terminated_pids.push(pid);
                }
            }
        }

        self.inner.audit.append(crate::types::AuditEvent {
            ts: self.inner.clock.now(),
            event: "gc_run".to_string(),
            id: None,
            kind: None,
            details: Some(json!({
                "removed_workspaces": removed_workspaces.len(),
                "terminated_pids": terminated_pids.len(),
            })),
        });

        GcResult {
            removed_workspaces,
            terminated_pids,
        }
    }
}

#[cfg(unix)]
fn signal_pid_if_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only probes liveness; SIGTERM is best-effort cleanup
    // of an orphaned process this manager no longer tracks.
    unsafe {
        if libc::kill(pid as libc::pid_t, 0) != 0 {
            return false;
        }
        libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0
    }
}

#[cfg(not(unix))]
fn signal_pid_if_alive(_pid: u32) -> bool {
    false
}

fn which_on_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn socket_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn lock(data: &StdMutex<Session>) -> std::sync::MutexGuard<'_, Session> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn build_access_state(mode: AccessMode, protect_origin: bool, allowlist_paths: Vec<String>) -> AccessState {
    match mode {
        AccessMode::Token => AccessState {
            mode,
            protect_origin,
            token: Some(access::new_token()),
            username: None,
            password: None,
            allowlist_paths,
        },
        AccessMode::Basic => AccessState {
            mode,
            protect_origin,
            token: None,
            username: Some(access::BASIC_USERNAME.to_string()),
            password: Some(access::new_basic_password()),
            allowlist_paths,
        },
        AccessMode::None => AccessState {
            mode,
            protect_origin,
            token: None,
            username: None,
            password: None,
            allowlist_paths,
        },
    }
}

fn session_to_value(session: &Session, manifest_cap: usize) -> Value {
    let manifest_truncated = session.manifest.len() > manifest_cap;
    let manifest: Vec<Value> = session
        .manifest
        .iter()
        .take(manifest_cap)
        .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
        .collect();

    json!({
        "id": session.id,
        "type": session.kind,
        "status": session.status,
        "created_at": session.created_at,
        "expires_at": session.expires_at,
        "ttl_seconds": session.ttl_seconds,
        "source_port": session.source_port,
        "origin_port": session.origin_port,
        "workspace_dir": session.workspace_dir,
        "manifest": manifest,
        "manifest_truncated": manifest_truncated,
        "files_mode": session.files_mode,
        "presentation": session.presentation,
        "access_mode": session.access.mode,
        "access_info": access::masked_access_info(&session.access),
        "max_downloads": session.max_downloads,
        "public_url": session.public_url,
        "local_url": session.local_url,
        "stats": session.stats,
        "last_error": session.last_error,
        "process_pid": session.process_pid,
    })
}

fn project_fields(value: Value, fields: &[String]) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    let mut out = serde_json::Map::new();
    for field in fields {
        if let Some(v) = map.get(field) {
            out.insert(field.clone(), v.clone());
        }
    }
    Value::Object(out)
}

/// The `OriginHost` seam an origin uses to touch a session's shared state
/// without depending on the session table directly. Counter updates and
/// log appends go through a mutex so concurrent requests never race.
struct SessionOriginHost {
    data: Arc<StdMutex<Session>>,
    rate_limiter: Arc<RateLimiter>,
    stop_tx: mpsc::UnboundedSender<StopCmd>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl OriginHost for SessionOriginHost {
    fn access(&self) -> AccessState {
        lock(&self.data).access.clone()
    }

    fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    async fn record_request(&self) {
        let mut guard = lock(&self.data);
        guard.stats.requests += 1;
        guard.stats.last_access_at = Some(self.clock.now());
    }

    async fn record_response(&self, bytes_sent: u64, is_download: bool) {
        let hit_quota = {
            let mut guard = lock(&self.data);
            guard.stats.bytes_sent += bytes_sent;
            if is_download {
                guard.stats.downloads += 1;
            }
            is_download
                && guard
                    .max_downloads
                    .is_some_and(|max| guard.stats.downloads >= max)
        };
        if hit_quota {
            self.request_stop("max_downloads_reached").await;
        }
    }

    async fn log(&self, component: LogComponent, line: String) {
        let mut guard = lock(&self.data);
        let ts = self.clock.now();
        guard.logs.push(LogEntry { ts, component, line });
    }

    async fn request_stop(&self, reason: &'static str) {
        let _ = self.stop_tx.send(StopCmd {
            reason: StopReason::Quota(reason),
            reply: None,
        });
    }
}

/// The single guarded critical section for one session's terminal
/// transition: owns the tunnel child and origin server handles for the
/// session's lifetime and is the sole place any of TTL expiry, child exit,
/// or a request-driven stop actually tears the session down. Whichever
/// source resolves the `select!` first wins; the others never get a
/// chance to race it because they all funnel through this one task via
/// `stop_tx`/timers/`wait_exit`.
async fn run_supervisor(
    inner: Arc<Inner>,
    id: String,
    data: Arc<StdMutex<Session>>,
    mut tunnel_handle: TunnelHandle,
    origin: OriginResources,
    sleep_duration: Duration,
    mut stop_rx: mpsc::UnboundedReceiver<StopCmd>,
) {
    enum Outcome {
        Expired,
        ChildExit(i32),
        Cmd(Option<StopCmd>),
    }

    let outcome = tokio::select! {
        _ = tokio::time::sleep(sleep_duration) => Outcome::Expired,
        code = tunnel_handle.wait_exit() => Outcome::ChildExit(code),
        cmd = stop_rx.recv() => Outcome::Cmd(cmd),
    };

    let (event_name, status, last_error, details, reply) = match outcome {
        Outcome::Expired => ("exposure_expired", SessionStatus::Expired, None, None, None),
        Outcome::ChildExit(code) => (
            "exposure_stopped",
            SessionStatus::Error,
            Some(format!("tunnel agent exited unexpectedly with code {code}")),
            Some(json!({"reason": "agent_exit_while_running", "code": code})),
            None,
        ),
        Outcome::Cmd(None) => ("exposure_stopped", SessionStatus::Stopped, None, None, None),
        Outcome::Cmd(Some(cmd)) => match cmd.reason {
            StopReason::User => ("exposure_stopped", SessionStatus::Stopped, None, None, cmd.reply),
            StopReason::Expired => ("exposure_expired", SessionStatus::Expired, None, None, cmd.reply),
            StopReason::Quota(reason) => (
                "exposure_stopped",
                SessionStatus::Stopped,
                None,
                Some(json!({"reason": reason})),
                cmd.reply,
            ),
            StopReason::ChildExit(code) => (
                "exposure_stopped",
                SessionStatus::Error,
                Some(format!("tunnel agent exited unexpectedly with code {code}")),
                Some(json!({"reason": "agent_exit_while_running", "code": code})),
                cmd.reply,
            ),
        },
    };

    tunnel_handle.terminate().await;
    match origin {
        OriginResources::Proxy(proxy) => proxy.shutdown(),
        OriginResources::Static(origin) => origin.shutdown(),
        OriginResources::None => {}
    }

    let (workspace_dir, kind) = {
        let mut guard = lock(&data);
        guard.status = status;
        guard.last_error = last_error;
        (guard.workspace_dir.clone(), guard.kind)
    };

    let mut workspace_removed = None;
    if let Some(dir) = &workspace_dir {
        if tokio::fs::remove_dir_all(dir).await.is_ok() {
            workspace_removed = Some(dir.clone());
        }
    }

    inner.audit.append(crate::types::AuditEvent {
        ts: inner.clock.now(),
        event: event_name.to_string(),
        id: Some(id.clone()),
        kind: Some(kind),
        details,
    });

    {
        let sessions = inner.sessions.read().await;
        let snapshot: Vec<SessionSnapshot> = sessions
            .values()
            .map(|h| SessionSnapshot::from(&*lock(&h.data)))
            .collect();
        drop(sessions);
        if let Err(err) = audit::write_snapshot(&inner.state_dir, &snapshot) {
            warn!(error = %err, "failed to persist session snapshot during teardown");
        }
    }

    inner.sessions.write().await.remove(&id);

    if let Some(reply) = reply {
        let _ = reply.send(StopOutcome { workspace_removed });
    }
}

/// Enumerates the session table every 30s and retires every `running`
/// session past its `expires_at`. A backstop alongside each session's own
/// sleep-until-TTL in [`run_supervisor`] — whichever fires first wins, the
/// other observes a removed entry.
fn spawn_reaper(inner: Arc<Inner>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        loop {
            interval.tick().await;
            let now = inner.clock.now();
            let handles: Vec<Arc<SessionHandle>> =
                inner.sessions.read().await.values().cloned().collect();
            for handle in handles {
                let expired = {
                    let guard = lock(&handle.data);
                    guard.status == SessionStatus::Running && guard.expires_at <= now
                };
                if expired {
                    let _ = handle.stop_tx.send(StopCmd {
                        reason: StopReason::Expired,
                        reply: None,
                    });
                }
            }
        }
    });
}
