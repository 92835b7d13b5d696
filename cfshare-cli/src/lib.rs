//! `cfshare`: the thin adapter over [`cfshare_core::ExposureManager`].
//! Parses `--params`/`--params-file`, dispatches to one core operation, and
//! serializes the result as JSON. Input schema validation, the HTML preview
//! renderers and the quick-tunnel agent binary itself are the core's
//! concern, not this crate's.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use cfshare_core::ExposeFilesRequest;
use cfshare_core::ExposePortRequest;
use cfshare_core::ExposureManager;
use cfshare_core::GetFilter;
use cfshare_core::GetRequest;
use cfshare_core::GetSelector;
use cfshare_core::ManagerDeps;
use cfshare_core::StopTargets;
use cfshare_core::audit::AuditFilters;
use cfshare_core::clock::SystemClock;
use cfshare_core::http_client::RealPublicProbe;
use cfshare_core::process::RealProcessLauncher;
use cfshare_core::types::AccessMode;
use cfshare_core::types::FilesMode;
use cfshare_core::types::LogComponent;
use cfshare_core::types::Presentation;
use cfshare_core::types::SessionKind;
use cfshare_core::types::SessionStatus;
use clap::Parser;
use serde_json::Value;
use serde_json::json;

pub mod args;

pub use args::Cli;

/// Default state directory for the standalone CLI adapter.
fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cfshare")
}

/// Run the parsed CLI invocation to completion, returning the process exit
/// code (0 success, 1 failure). Diagnostics go to stderr; a successful
/// result's JSON goes to stdout.
pub async fn run(cli: Cli) -> i32 {
    match dispatch(&cli).await {
        Ok(value) => {
            println!("{}", render(&value, cli.compact));
            0
        }
        Err(err) => {
            eprintln!("cfshare: {err:#}");
            1
        }
    }
}

fn render(value: &Value, compact: bool) -> String {
    if compact {
        value.to_string()
    } else {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    }
}

async fn dispatch(cli: &Cli) -> Result<Value> {
    let state_dir = default_state_dir();
    let cwd = cli
        .workspace_dir
        .clone()
        .unwrap_or(std::env::current_dir().context("resolving current directory")?);
    let params = load_params(cli)?;

    let manager = build_manager(state_dir, cwd);

    if let Some(patch) = load_config_patch(cli)? {
        manager
            .apply_runtime_config(&patch)
            .await
            .context("applying --config override")?;
    }

    match cli.tool.as_str() {
        "env-check" => Ok(manager.env_check().await),
        "policy" => run_policy(&manager, &params).await,
        "expose-port" => run_expose_port(&manager, &params, cli).await,
        "expose-files" => run_expose_files(&manager, &params, cli).await,
        "list" | "get" => run_get(&manager, &params).await,
        "stop" => run_stop(&manager, &params).await,
        "logs" => run_logs(&manager, &params).await,
        "audit" => run_audit(&manager, &params).await,
        "maintenance" => run_maintenance(&manager, &params).await,
        other => bail!("unknown tool: {other}"),
    }
}

fn build_manager(state_dir: PathBuf, cwd: PathBuf) -> ExposureManager {
    let deps = ManagerDeps::new(
        state_dir,
        cwd,
        Arc::new(SystemClock),
        Arc::new(RealProcessLauncher),
        Arc::new(RealPublicProbe::default()),
    );
    ExposureManager::new(deps)
}

fn load_params(cli: &Cli) -> Result<Value> {
    match (&cli.params, &cli.params_file) {
        (Some(_), Some(_)) => bail!("--params and --params-file are mutually exclusive"),
        (Some(raw), None) => serde_json::from_str(raw).context("parsing --params as JSON"),
        (None, Some(path)) => read_json_file(path).context("parsing --params-file as JSON"),
        (None, None) => Ok(Value::Object(serde_json::Map::new())),
    }
}

fn load_config_patch(cli: &Cli) -> Result<Option<Value>> {
    match (&cli.config, &cli.config_file) {
        (Some(_), Some(_)) => bail!("--config and --config-file are mutually exclusive"),
        (Some(raw), None) => Ok(Some(
            serde_json::from_str(raw).context("parsing --config as JSON")?,
        )),
        (None, Some(path)) => Ok(Some(read_json_file(path)?)),
        (None, None) => Ok(None),
    }
}

fn read_json_file(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn str_field<'a>(params: &'a Value, field: &str) -> Option<&'a str> {
    params.get(field).and_then(Value::as_str)
}

fn parse_access_mode(params: &Value, field: &str) -> Result<Option<AccessMode>> {
    match str_field(params, field) {
        None => Ok(None),
        Some("token") => Ok(Some(AccessMode::Token)),
        Some("basic") => Ok(Some(AccessMode::Basic)),
        Some("none") => Ok(Some(AccessMode::None)),
        Some(other) => bail!("invalid {field}: {other}"),
    }
}

async fn run_policy(manager: &ExposureManager, params: &Value) -> Result<Value> {
    if let Some(patch) = params.get("patch") {
        let (policy, warnings) = manager.update_policy(patch).await?;
        return Ok(json!({"policy": policy, "warnings": warnings}));
    }
    Ok(json!({"policy": manager.policy().await, "raw": manager.read_raw_policy().await}))
}

async fn run_expose_port(manager: &ExposureManager, params: &Value, cli: &Cli) -> Result<Value> {
    let port: u16 = params
        .get("port")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("expose-port requires a numeric \"port\""))?
        .try_into()
        .context("port out of range")?;

    let req = ExposePortRequest {
        port,
        access: parse_access_mode(params, "access")?,
        ttl_seconds: params.get("ttl_seconds").and_then(Value::as_u64),
        protect_origin: params.get("protect_origin").and_then(Value::as_bool),
        allowlist_paths: string_array(params, "allowlist_paths"),
    };

    if cli.keep_alive {
        return background::spawn_detached(cli, "expose-port");
    }
    Ok(manager.expose_port(req).await?)
}

async fn run_expose_files(manager: &ExposureManager, params: &Value, cli: &Cli) -> Result<Value> {
    let paths: Vec<PathBuf> = params
        .get("paths")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("expose-files requires a \"paths\" array"))?
        .iter()
        .filter_map(Value::as_str)
        .map(PathBuf::from)
        .collect();
    if paths.is_empty() {
        bail!("expose-files requires at least one path");
    }

    let mode = match str_field(params, "mode") {
        None => None,
        Some("normal") => Some(FilesMode::Normal),
        Some("zip") => Some(FilesMode::Zip),
        Some(other) => bail!("invalid mode: {other}"),
    };
    let presentation = match str_field(params, "presentation") {
        None => None,
        Some("preview") => Some(Presentation::Preview),
        Some("download") => Some(Presentation::Download),
        Some("raw") => Some(Presentation::Raw),
        Some(other) => bail!("invalid presentation: {other}"),
    };

    let req = ExposeFilesRequest {
        paths,
        access: parse_access_mode(params, "access")?,
        ttl_seconds: params.get("ttl_seconds").and_then(Value::as_u64),
        protect_origin: params.get("protect_origin").and_then(Value::as_bool),
        allowlist_paths: string_array(params, "allowlist_paths"),
        mode,
        presentation,
        max_downloads: params
            .get("max_downloads")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        title: params.get("title").and_then(Value::as_str).map(str::to_string),
    };

    if cli.keep_alive {
        return background::spawn_detached(cli, "expose-files");
    }
    Ok(manager.expose_files(req).await?)
}

fn string_array(params: &Value, field: &str) -> Vec<String> {
    params
        .get(field)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

async fn run_get(manager: &ExposureManager, params: &Value) -> Result<Value> {
    let selector = if let Some(id) = params.get("id").and_then(Value::as_str) {
        GetSelector::Id(id.to_string())
    } else if let Some(ids) = params.get("ids").and_then(Value::as_array) {
        GetSelector::Ids(ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
    } else if let Some(filter) = params.get("filter") {
        let status = match filter.get("status").and_then(Value::as_str) {
            None => None,
            Some("starting") => Some(SessionStatus::Starting),
            Some("running") => Some(SessionStatus::Running),
            Some("stopped") => Some(SessionStatus::Stopped),
            Some("error") => Some(SessionStatus::Error),
            Some("expired") => Some(SessionStatus::Expired),
            Some(other) => bail!("invalid filter.status: {other}"),
        };
        let kind = match filter.get("kind").and_then(Value::as_str) {
            None => None,
            Some("port") => Some(SessionKind::Port),
            Some("files") => Some(SessionKind::Files),
            Some(other) => bail!("invalid filter.kind: {other}"),
        };
        GetSelector::Filter(GetFilter { status, kind })
    } else {
        GetSelector::Id("all".to_string())
    };

    let fields = params
        .get("fields")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect());
    let probe_public = params.get("probe_public").and_then(Value::as_bool).unwrap_or(false);

    let response = manager
        .get(GetRequest { selector, fields, probe_public })
        .await?;
    Ok(json!({"sessions": response.sessions, "truncated": response.truncated}))
}

async fn run_stop(manager: &ExposureManager, params: &Value) -> Result<Value> {
    let targets = if let Some(id) = params.get("id").and_then(Value::as_str) {
        if id == "all" {
            StopTargets::All
        } else {
            StopTargets::Id(id.to_string())
        }
    } else if let Some(ids) = params.get("ids").and_then(Value::as_array) {
        StopTargets::Ids(ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
    } else {
        bail!("stop requires \"id\" or \"ids\"");
    };

    let result = manager.stop(targets).await;
    Ok(json!({
        "stopped": result.stopped,
        "failed": result.failed.into_iter().map(|f| json!({"id": f.id, "error": f.error})).collect::<Vec<_>>(),
        "cleaned": result.cleaned,
    }))
}

async fn run_logs(manager: &ExposureManager, params: &Value) -> Result<Value> {
    let id = str_field(params, "id").ok_or_else(|| anyhow!("logs requires \"id\""))?;
    let component = match str_field(params, "component") {
        None | Some("all") => None,
        Some("tunnel") => Some(LogComponent::Tunnel),
        Some("origin") => Some(LogComponent::Origin),
        Some("manager") => Some(LogComponent::Manager),
        Some(other) => bail!("invalid component: {other}"),
    };
    let since_seconds = params.get("since_seconds").and_then(Value::as_i64);
    let n = params.get("n").and_then(Value::as_u64).unwrap_or(200) as usize;

    let entries = manager.logs(id, component, since_seconds, n).await?;
    Ok(json!({"logs": entries}))
}

async fn run_audit(manager: &ExposureManager, params: &Value) -> Result<Value> {
    let filters = AuditFilters {
        event: str_field(params, "event").map(str::to_string),
        id: str_field(params, "id").map(str::to_string),
        since: str_field(params, "since").map(str::to_string),
        until: str_field(params, "until").map(str::to_string),
        limit: params.get("limit").and_then(Value::as_u64).map(|v| v as usize),
    };

    if params.get("export").and_then(Value::as_bool).unwrap_or(false) {
        let output_path = str_field(params, "output_path").map(PathBuf::from);
        let path = manager.audit_export(&filters, output_path)?;
        return Ok(json!({"exported_to": path}));
    }
    Ok(json!({"events": manager.audit_query(&filters)}))
}

async fn run_maintenance(manager: &ExposureManager, params: &Value) -> Result<Value> {
    match str_field(params, "action") {
        None | Some("run_gc") => {
            let result = manager.run_gc().await;
            Ok(json!({
                "removed_workspaces": result.removed_workspaces,
                "terminated_pids": result.terminated_pids,
            }))
        }
        Some(other) => bail!("unknown maintenance action: {other}"),
    }
}

/// The detached-worker handoff for `--keep-alive`: re-exec this binary
/// with the same `--params`, minus `--keep-alive`, detached from the
/// current session so an expose operation outlives the invoking shell.
mod background {
    use super::*;

    pub fn spawn_detached(cli: &Cli, tool: &str) -> Result<Value> {
        let exe = std::env::current_exe().context("resolving current executable")?;
        let mut command = std::process::Command::new(exe);
        command.arg(tool);
        if let Some(params) = &cli.params {
            command.arg("--params").arg(params);
        }
        if let Some(path) = &cli.params_file {
            command.arg("--params-file").arg(path);
        }
        if let Some(dir) = &cli.workspace_dir {
            command.arg("--workspace-dir").arg(dir);
        }
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        // SAFETY: setsid() is called in the child between fork and exec via
        // pre_exec, detaching it from the parent's controlling terminal so
        // it survives the invoking shell exiting.
        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().context("spawning detached worker")?;
        let handoff_path = std::env::temp_dir().join(format!("cfshare-handoff-{}.json", child.id()));
        std::fs::write(
            &handoff_path,
            serde_json::to_vec_pretty(&json!({"pid": child.id(), "tool": tool}))?,
        )
        .context("writing handoff file")?;

        Ok(json!({"detached": true, "pid": child.id(), "handoff_file": handoff_path}))
    }
}

/// Parse argv and dispatch; the entry point `main.rs` calls this after
/// installing the `tracing` subscriber (only the binary installs it, never
/// the library).
pub async fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    run(cli).await
}
