#![allow(clippy::unwrap_used)]

mod common;

use cfshare_core::ExposeFilesRequest;
use cfshare_core::ExposePortRequest;
use cfshare_core::ExposureManager;
use cfshare_core::GetRequest;
use cfshare_core::GetSelector;
use cfshare_core::ManagerDeps;
use cfshare_core::StopTargets;
use cfshare_core::audit::AuditFilters;
use cfshare_core::clock::Clock;
use cfshare_core::clock::FakeClock;
use cfshare_core::process::RealProcessLauncher;
use cfshare_core::types::FilesMode;
use cfshare_core::types::SessionStatus;
use chrono::Duration as ChronoDuration;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tempfile::tempdir;

fn manager(state: &std::path::Path, cwd: &std::path::Path) -> ExposureManager {
    let deps = ManagerDeps::new(
        state.to_path_buf(),
        cwd.to_path_buf(),
        common::system_clock(),
        Arc::new(common::FakeLauncher::default()),
        Arc::new(common::FakeProbe),
    );
    ExposureManager::new(deps)
}

fn manager_with_clock(
    state: &std::path::Path,
    cwd: &std::path::Path,
    clock: Arc<dyn Clock>,
) -> ExposureManager {
    let deps = ManagerDeps::new(
        state.to_path_buf(),
        cwd.to_path_buf(),
        clock,
        Arc::new(common::FakeLauncher::default()),
        Arc::new(common::FakeProbe),
    );
    ExposureManager::new(deps)
}

/// Polls `mgr.get(all)` until `id` is no longer present (the supervisor
/// task has torn the session down), yielding to let background tasks and
/// the paused-time executor make progress instead of sleeping on the wall
/// clock.
async fn wait_until_gone(mgr: &ExposureManager, id: &str) -> bool {
    for _ in 0..500 {
        let all = mgr
            .get(GetRequest {
                selector: GetSelector::Id("all".to_string()),
                fields: None,
                probe_public: false,
            })
            .await
            .expect("get all");
        if all.sessions.iter().all(|s| s["id"] != id) {
            return true;
        }
        tokio::task::yield_now().await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expose_port_then_stop_round_trips() {
    let state_dir = tempdir().unwrap();
    let cwd = tempdir().unwrap();
    let mgr = manager(state_dir.path(), cwd.path());

    let (port, listener) = common::spawn_local_service().await;
    common::accept_forever(listener);

    let result = mgr
        .expose_port(ExposePortRequest {
            port,
            ..Default::default()
        })
        .await
        .expect("expose_port should succeed against a live local listener");

    let id = result["id"].as_str().unwrap().to_string();
    assert_eq!(result["status"], "running");
    assert!(result["public_url"].as_str().unwrap().contains("trycloudflare.com"));

    let fetched = mgr
        .get(GetRequest {
            selector: GetSelector::Id(id.clone()),
            fields: None,
            probe_public: false,
        })
        .await
        .expect("get by id");
    assert_eq!(fetched.sessions.len(), 1);
    assert_eq!(fetched.sessions[0]["id"], id.as_str());

    let stopped = mgr.stop(StopTargets::Id(id.clone())).await;
    assert_eq!(stopped.stopped, vec![id.clone()]);
    assert!(stopped.failed.is_empty());

    let after_stop = mgr
        .get(GetRequest {
            selector: GetSelector::Id("all".to_string()),
            fields: None,
            probe_public: false,
        })
        .await
        .expect("get all");
    assert!(after_stop.sessions.iter().all(|s| s["id"] != id.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expose_port_rejects_blocked_port() {
    let state_dir = tempdir().unwrap();
    let cwd = tempdir().unwrap();
    let mgr = manager(state_dir.path(), cwd.path());

    let err = mgr
        .expose_port(ExposePortRequest {
            port: 22,
            ..Default::default()
        })
        .await
        .expect_err("port 22 is blocked by the default policy");
    assert_eq!(err.kind(), "policy_violation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expose_port_rejects_dead_local_port() {
    let state_dir = tempdir().unwrap();
    let cwd = tempdir().unwrap();
    let mgr = manager(state_dir.path(), cwd.path());

    // Bind then immediately drop so nothing is actually listening.
    let (port, listener) = common::spawn_local_service().await;
    drop(listener);

    let err = mgr
        .expose_port(ExposePortRequest {
            port,
            ..Default::default()
        })
        .await
        .expect_err("no local listener should fail bring-up");
    assert_eq!(err.kind(), "local_unreachable");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expose_files_zip_mode_enforces_download_quota() {
    let state_dir = tempdir().unwrap();
    let cwd = tempdir().unwrap();
    let mgr = manager(state_dir.path(), cwd.path());

    let source = tempdir().unwrap();
    std::fs::write(source.path().join("a.txt"), b"hello").unwrap();
    std::fs::write(source.path().join("b.txt"), b"world").unwrap();

    let result = mgr
        .expose_files(ExposeFilesRequest {
            paths: vec![source.path().to_path_buf()],
            mode: Some(FilesMode::Zip),
            max_downloads: Some(1),
            ..Default::default()
        })
        .await
        .expect("expose_files should succeed");

    assert_eq!(result["status"], "running");
    assert_eq!(result["type"], "files");
    let manifest = result["manifest"].as_array().expect("manifest array");
    assert!(manifest.iter().any(|e| e["name"] == "a.txt"));

    let id = result["id"].as_str().unwrap().to_string();
    let local_url = result["local_url"].as_str().expect("local_url set once running").to_string();

    let resp = reqwest::get(format!("{local_url}/download.zip"))
        .await
        .expect("GET against the running static origin");
    assert!(resp.status().is_success());

    assert!(
        wait_until_gone(&mgr, &id).await,
        "session should auto-stop once the download quota is reached"
    );

    let events = mgr.audit_query(&AuditFilters {
        id: Some(id.clone()),
        ..Default::default()
    });
    assert!(
        events
            .iter()
            .any(|e| e.event == "exposure_stopped" && e.id.as_deref() == Some(id.as_str())),
        "reaching max_downloads should record an exposure_stopped audit event"
    );
}

#[tokio::test(start_paused = true)]
async fn reaper_expires_session_after_ttl_with_paused_clock() {
    let state_dir = tempdir().unwrap();
    let cwd = tempdir().unwrap();
    let start = Local::now().fixed_offset();
    let clock = Arc::new(FakeClock::new(start));
    let mgr = manager_with_clock(state_dir.path(), cwd.path(), clock.clone());

    let (port, listener) = common::spawn_local_service().await;
    common::accept_forever(listener);

    let result = mgr
        .expose_port(ExposePortRequest {
            port,
            ttl_seconds: Some(60),
            ..Default::default()
        })
        .await
        .expect("expose_port should succeed against a live local listener");
    let id = result["id"].as_str().unwrap().to_string();
    assert_eq!(result["status"], "running");

    // Fast-forward both the injected clock (what the reaper compares
    // `expires_at` against) and Tokio's paused timer (what the session's
    // own TTL sleep in `run_supervisor` is waiting on) by the same amount,
    // matching how real time would have advanced.
    clock.advance(ChronoDuration::seconds(61));
    tokio::time::advance(StdDuration::from_secs(61)).await;

    assert!(
        wait_until_gone(&mgr, &id).await,
        "session should be torn down once its TTL has elapsed"
    );

    let events = mgr.audit_query(&AuditFilters {
        event: Some("exposure_expired".to_string()),
        id: Some(id.clone()),
        ..Default::default()
    });
    assert!(
        events.iter().any(|e| e.id.as_deref() == Some(id.as_str())),
        "expiring a session should append an exposure_expired audit event"
    );
}

#[tokio::test]
async fn env_check_reports_resolvability_of_configured_binary() {
    let state_dir = tempdir().unwrap();
    let cwd = tempdir().unwrap();
    let deps = ManagerDeps::new(
        state_dir.path().to_path_buf(),
        cwd.path().to_path_buf(),
        common::system_clock(),
        Arc::new(RealProcessLauncher),
        Arc::new(common::FakeProbe),
    );
    let mgr = ExposureManager::new(deps);
    let report = mgr.env_check().await;
    assert_eq!(report["tunnel_binary"], "cloudflared");
    assert!(report["resolvable"].is_boolean());
}
