//! 업데이트 파이프라인 테스트 (mock GitHub 서버)
//!
//! ## 테스트 시나리오
//! 1. 버전 확인: 새 릴리스 / 같은 버전 / dev 빌드 / API 오류
//! 2. 다운로드: 진행률 이벤트와 파일 내용
//! 3. 실행 파일 교체: 단계 순서, 교체된 내용, 실패 시 기존 파일 보존
//! 4. 실패 경로: 에셋 없음, 다운로드 실패, 중복 실행 거절

use crate::*;
use axum::extract::Path as AxumPath;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// 받은 이벤트를 모아두는 sink
#[derive(Default)]
struct Recorder(Mutex<Vec<ProgressEvent>>);

impl ProgressSink for Recorder {
    fn emit(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl Recorder {
    fn events(&self) -> Vec<ProgressEvent> {
        self.0.lock().unwrap().clone()
    }
}

/// mock GitHub 서버. 릴리스 JSON 의 `PLACEHOLDER` 는 실제 주소로 바뀐다.
async fn start_mock_github(
    release_status: StatusCode,
    release_json: &str,
    assets: HashMap<String, Vec<u8>>,
) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = release_json.replace("PLACEHOLDER", &format!("http://{}", addr));
    let assets = Arc::new(assets);

    let app = Router::new()
        .route(
            "/repos/:owner/:repo/releases/latest",
            get(move || {
                let body = body.clone();
                async move { (release_status, [("content-type", "application/json")], body) }
            }),
        )
        .route(
            "/download/:name",
            get(move |AxumPath(name): AxumPath<String>| {
                let assets = assets.clone();
                async move {
                    match assets.get(&name) {
                        Some(bytes) => (StatusCode::OK, bytes.clone()),
                        None => (StatusCode::NOT_FOUND, Vec::new()),
                    }
                }
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn release_json(tag: &str, asset_names: &[&str]) -> String {
    let assets: Vec<serde_json::Value> = asset_names
        .iter()
        .map(|n| {
            serde_json::json!({
                "name": n,
                "browser_download_url": format!("PLACEHOLDER/download/{}", n),
            })
        })
        .collect();
    serde_json::json!({ "tag_name": tag, "body": "Bug fixes", "assets": assets }).to_string()
}

fn pipeline(addr: SocketAddr, current: &str) -> UpdatePipeline {
    UpdatePipeline::new(UpdateConfig {
        current_version: current.to_string(),
        github_owner: "svgr-slth".into(),
        github_repo: "scdl-webui".into(),
        api_base_url: Some(format!("http://{}", addr)),
        linux_asset_name: "scdl-web-linux-amd64.AppImage".into(),
    })
    .unwrap()
}

// ═══════════════════════════════════════════════════════
// 버전 확인
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn newer_release_is_reported() {
    let addr = start_mock_github(StatusCode::OK, &release_json("v1.4.0", &[]), HashMap::new()).await;
    let info = pipeline(addr, "v1.3.9").check_for_update().await;

    assert!(info.available);
    assert_eq!(info.version, "v1.4.0");
    assert_eq!(info.notes, "Bug fixes");
}

#[tokio::test]
async fn same_or_older_release_is_not_an_update() {
    let addr = start_mock_github(StatusCode::OK, &release_json("v1.4.0", &[]), HashMap::new()).await;
    assert_eq!(pipeline(addr, "1.4.0").check_for_update().await, UpdateInfo::none());
    assert_eq!(pipeline(addr, "v1.5.0").check_for_update().await, UpdateInfo::none());
}

#[tokio::test]
async fn dev_build_never_updates() {
    let addr = start_mock_github(StatusCode::OK, &release_json("v9.9.9", &[]), HashMap::new()).await;
    let info = pipeline(addr, "dev").check_for_update().await;
    assert!(!info.available);
}

#[tokio::test]
async fn api_error_folds_into_no_update() {
    let addr = start_mock_github(StatusCode::INTERNAL_SERVER_ERROR, "{}", HashMap::new()).await;
    let p = pipeline(addr, "v1.0.0");

    assert_eq!(p.check_for_update().await, UpdateInfo::none());
    assert!(matches!(p.try_check().await, Err(UpdateError::Check(_))));

    let result = scheduler::check_once(&p).await;
    assert_eq!(scheduler::exit_code(&result), 1);
}

#[tokio::test]
async fn empty_tag_is_not_an_update() {
    let addr = start_mock_github(StatusCode::OK, &release_json("", &[]), HashMap::new()).await;
    assert!(!pipeline(addr, "v1.0.0").check_for_update().await.available);
}

// ═══════════════════════════════════════════════════════
// 다운로드
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn download_reports_monotonic_progress() {
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let mut assets = HashMap::new();
    assets.insert("scdl-web-linux-amd64.AppImage".to_string(), payload.clone());
    let addr = start_mock_github(StatusCode::OK, &release_json("v1.4.0", &[]), assets).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("nested").join(".scdl-web.update");
    let client = GitHubClient::new("o", "r").unwrap();
    let mut seen = Vec::new();

    let copied = download::download_to_file(
        client.http(),
        &format!("http://{}/download/scdl-web-linux-amd64.AppImage", addr),
        &dest,
        |p| seen.push(p),
    )
    .await
    .unwrap();

    assert_eq!(copied, payload.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert!(!seen.is_empty() && seen.len() <= 101);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last(), Some(&100));
}

// ═══════════════════════════════════════════════════════
// 실행 파일 교체
// ═══════════════════════════════════════════════════════

const LINUX_ASSET: &str = "scdl-web-linux-amd64.AppImage";

fn self_replace_pipeline(addr: SocketAddr, target: &std::path::Path) -> UpdatePipeline {
    pipeline(addr, "v1.3.9").with_strategy(
        InstallStrategy::SelfReplace { target: Some(target.to_path_buf()) },
        Some(AssetSelector::Exact(LINUX_ASSET.into())),
    )
}

// 재실행까지 가므로 받은 파일은 곧바로 끝나는 스크립트다
#[cfg(unix)]
#[tokio::test]
async fn self_replace_runs_phases_in_order_and_swaps_target() {
    let payload = b"#!/bin/sh\nexit 0\n".to_vec();
    let mut assets = HashMap::new();
    assets.insert(LINUX_ASSET.to_string(), payload.clone());
    let addr = start_mock_github(StatusCode::OK, &release_json("v1.4.0", &[LINUX_ASSET]), assets).await;

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("scdl-web");
    std::fs::write(&target, b"old build").unwrap();
    let sink = Recorder::default();

    let outcome = self_replace_pipeline(addr, &target)
        .download_and_install("v1.4.0", &sink)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        InstallOutcome::Replaced { executable: target.clone(), method: ReplaceMethod::Rename }
    );
    assert_eq!(std::fs::read(&target).unwrap(), payload);
    assert!(!dir.path().join(install::REPLACE_SCRATCH_NAME).exists());

    let mut phases: Vec<Phase> = sink.events().iter().map(|e| e.phase).collect();
    phases.dedup();
    assert_eq!(phases, vec![Phase::Download, Phase::Installing, Phase::Done]);
    assert_eq!(sink.events().last().unwrap().message, "Update installed. Restarting...");
}

#[cfg(unix)]
#[tokio::test]
async fn unwritable_install_dir_leaves_target_untouched() {
    use std::os::unix::fs::PermissionsExt;

    let mut assets = HashMap::new();
    assets.insert(LINUX_ASSET.to_string(), b"new build".to_vec());
    let addr = start_mock_github(StatusCode::OK, &release_json("v1.4.0", &[LINUX_ASSET]), assets).await;

    let dir = tempfile::tempdir().unwrap();
    let install_dir = dir.path().join("install");
    std::fs::create_dir(&install_dir).unwrap();
    let target = install_dir.join("scdl-web");
    std::fs::write(&target, b"old build").unwrap();
    std::fs::set_permissions(&install_dir, std::fs::Permissions::from_mode(0o555)).unwrap();

    // root 는 권한 비트를 무시하므로 검증할 수 없다
    let writable = std::fs::File::create(install_dir.join(".write-check")).is_ok();
    if writable {
        std::fs::set_permissions(&install_dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let sink = Recorder::default();
    let result = self_replace_pipeline(addr, &target).download_and_install("v1.4.0", &sink).await;
    std::fs::set_permissions(&install_dir, std::fs::Permissions::from_mode(0o755)).unwrap();

    assert!(matches!(result, Err(UpdateError::Download(_))));
    assert_eq!(std::fs::read(&target).unwrap(), b"old build");
    assert_eq!(sink.events().last().unwrap().phase, Phase::Error);
}

// ═══════════════════════════════════════════════════════
// 실패 경로
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn missing_asset_emits_error() {
    let addr = start_mock_github(
        StatusCode::OK,
        &release_json("v1.4.0", &["scdl-web-macos.dmg"]),
        HashMap::new(),
    )
    .await;
    let p = pipeline(addr, "v1.3.9").with_strategy(
        InstallStrategy::InstallerLaunch,
        Some(AssetSelector::Suffix("-installer.exe".into())),
    );
    let sink = Recorder::default();

    let err = p.download_and_install("v1.4.0", &sink).await.unwrap_err();

    assert!(matches!(err, UpdateError::AssetMissing));
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].phase, Phase::Error);
    assert_eq!(events[0].message, "No update asset found for this platform");
    assert!(!p.is_running());
}

#[tokio::test]
async fn failed_download_emits_error_after_start() {
    // 릴리스에는 있지만 다운로드 URL 은 404
    let addr = start_mock_github(
        StatusCode::OK,
        &release_json("v1.4.0", &["scdl-web-1.4.0-installer.exe"]),
        HashMap::new(),
    )
    .await;
    let p = pipeline(addr, "v1.3.9").with_strategy(
        InstallStrategy::InstallerLaunch,
        Some(AssetSelector::Suffix("-installer.exe".into())),
    );
    let sink = Recorder::default();

    let err = p.download_and_install("v1.4.0", &sink).await.unwrap_err();

    assert!(matches!(err, UpdateError::Download(_)));
    let events = sink.events();
    assert_eq!(events.first().unwrap().message, "Starting download...");
    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert!(last.message.starts_with("Download failed:"), "{}", last.message);
}

#[tokio::test]
async fn overlapping_install_is_rejected() {
    let addr = start_mock_github(StatusCode::OK, &release_json("v1.4.0", &[]), HashMap::new()).await;
    let p = pipeline(addr, "v1.3.9");
    let sink = Recorder::default();

    let _held = InFlightGuard::try_acquire(&p.in_flight).unwrap();
    let err = p.download_and_install("v1.4.0", &sink).await.unwrap_err();

    assert!(matches!(err, UpdateError::AlreadyRunning));
    assert_eq!(sink.events()[0].message, "Update already in progress");
    assert!(p.is_running());
}

#[test]
fn guard_releases_flag_on_drop() {
    let flag = Arc::new(AtomicBool::new(false));
    {
        let _g = InFlightGuard::try_acquire(&flag).unwrap();
        assert!(InFlightGuard::try_acquire(&flag).is_none());
    }
    assert!(InFlightGuard::try_acquire(&flag).is_some());
}
