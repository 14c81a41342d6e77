//! # scdl-web 데스크톱 업데이터 라이브러리
//!
//! GitHub 최신 릴리스를 확인하고, 플랫폼에 맞는 에셋을 내려받아 설치한다.
//!
//! ## 동작 원리
//! - **확인** (`check_for_update`): 실패해도 에러를 내지 않고 "업데이트 없음" 을 돌려준다.
//!   개발 빌드(`dev`)는 항상 "업데이트 없음".
//! - **다운로드/설치** (`download_and_install`): 진행 상황을 [`ProgressSink`] 로 흘려보낸다.
//!   동시에 하나만 실행되며, 겹치는 요청은 [`UpdateError::AlreadyRunning`] 으로 거절된다.
//! - **설치 전략** (`install.rs`): Windows 는 설치 프로그램 실행, 그 외는 실행 파일 교체 후 재실행.
//!
//! 설치가 끝난 뒤 워커 정지와 앱 종료는 호출 측 책임이다.

pub mod download;
pub mod error;
pub mod github;
pub mod install;
pub mod scheduler;
pub mod version;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use error::UpdateError;
pub use github::{AssetSelector, GitHubClient, Release, ReleaseAsset};
pub use install::{InstallOutcome, InstallStrategy, ReplaceMethod};
pub use scheduler::SchedulerConfig;
pub use version::{compare_versions, is_dev_build, SemVer};

// ── 설정 / 결과 타입 ──────────────────────────────────────

/// 업데이트 설정
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// 실행 중인 빌드 버전 (`dev` 면 업데이트 확인 생략)
    pub current_version: String,
    pub github_owner: String,
    pub github_repo: String,
    /// API base URL 오버라이드 (mock 서버 등)
    pub api_base_url: Option<String>,
    /// Linux 릴리스 에셋의 정확한 파일명
    pub linux_asset_name: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            current_version: version::DEV_VERSION.to_string(),
            github_owner: "svgr-slth".to_string(),
            github_repo: "scdl-webui".to_string(),
            api_base_url: None,
            linux_asset_name: "scdl-web-linux-amd64.AppImage".to_string(),
        }
    }
}

/// 업데이트 확인 결과
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub available: bool,
    pub version: String,
    pub notes: String,
}

impl UpdateInfo {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Download,
    Installing,
    Done,
    Error,
}

/// `update:progress` 이벤트 페이로드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub percent: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(phase: Phase, percent: u8, message: impl Into<String>) -> Self {
        Self { phase, percent, message: message.into() }
    }
}

/// 진행 상황 수신자 (UI 알림 채널 등)
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

// ── 파이프라인 ──────────────────────────────────────────

/// 플래그를 세우고, drop 시 내린다
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct UpdatePipeline {
    config: UpdateConfig,
    github: GitHubClient,
    strategy: InstallStrategy,
    selector: Option<AssetSelector>,
    in_flight: Arc<AtomicBool>,
}

impl UpdatePipeline {
    pub fn new(config: UpdateConfig) -> Result<Self, UpdateError> {
        let github = GitHubClient::with_base_url(
            &config.github_owner,
            &config.github_repo,
            config.api_base_url.as_deref(),
        )?;
        let selector = AssetSelector::for_current_platform(&config.linux_asset_name);
        Ok(Self {
            config,
            github,
            strategy: InstallStrategy::for_current_platform(),
            selector,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 설치 전략과 에셋 규칙을 바꾼다 (테스트, 특수 배포본)
    pub fn with_strategy(mut self, strategy: InstallStrategy, selector: Option<AssetSelector>) -> Self {
        self.strategy = strategy;
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 새 버전 확인. 어떤 실패든 "업데이트 없음" 으로 접는다.
    pub async fn check_for_update(&self) -> UpdateInfo {
        match self.try_check().await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("[Updater] Update check failed: {}", e);
                UpdateInfo::none()
            }
        }
    }

    /// 실패를 그대로 돌려주는 확인 (CLI `check-update` 용)
    pub async fn try_check(&self) -> Result<UpdateInfo, UpdateError> {
        if is_dev_build(&self.config.current_version) {
            tracing::debug!("[Updater] Development build, skipping update check");
            return Ok(UpdateInfo::none());
        }

        let release = self.github.fetch_latest_release().await?;
        if release.tag_name.trim().is_empty() {
            return Ok(UpdateInfo::none());
        }

        let ordering = compare_versions(&release.tag_name, &self.config.current_version);
        if ordering != std::cmp::Ordering::Greater {
            tracing::info!(
                "[Updater] Up to date ({} >= {})",
                self.config.current_version,
                release.tag_name
            );
            return Ok(UpdateInfo::none());
        }

        tracing::info!(
            "[Updater] Update available: {} -> {}",
            self.config.current_version,
            release.tag_name
        );
        Ok(UpdateInfo {
            available: true,
            notes: release.notes(),
            version: release.tag_name,
        })
    }

    /// 다운로드와 설치를 끝까지 실행한다. 진행 상황과 최종 실패는 sink 로 알린다.
    pub async fn download_and_install(
        &self,
        target_version: &str,
        sink: &dyn ProgressSink,
    ) -> Result<InstallOutcome, UpdateError> {
        let guard = match InFlightGuard::try_acquire(&self.in_flight) {
            Some(guard) => guard,
            None => {
                let err = UpdateError::AlreadyRunning;
                tracing::warn!("[Updater] {}", err);
                sink.emit(ProgressEvent::new(Phase::Error, 0, err.to_string()));
                return Err(err);
            }
        };

        let result = self.run(target_version, sink).await;
        drop(guard);

        if let Err(ref e) = result {
            tracing::error!("[Updater] {}", e);
            sink.emit(ProgressEvent::new(Phase::Error, 0, e.to_string()));
        }
        result
    }

    /// 백그라운드 태스크로 실행. 이미 진행 중이면 즉시 거절한다.
    pub fn spawn_download_and_install(
        self: &Arc<Self>,
        target_version: String,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<tokio::task::JoinHandle<Result<InstallOutcome, UpdateError>>, UpdateError> {
        if self.is_running() {
            let err = UpdateError::AlreadyRunning;
            sink.emit(ProgressEvent::new(Phase::Error, 0, err.to_string()));
            return Err(err);
        }
        let pipeline = Arc::clone(self);
        Ok(tokio::spawn(async move {
            pipeline.download_and_install(&target_version, sink.as_ref()).await
        }))
    }

    async fn run(&self, target_version: &str, sink: &dyn ProgressSink) -> Result<InstallOutcome, UpdateError> {
        let release = self.github.fetch_latest_release().await?;
        if !target_version.is_empty() && release.tag_name != target_version {
            tracing::warn!(
                "[Updater] Requested {} but latest release is {}; installing latest",
                target_version,
                release.tag_name
            );
        }

        let asset = self
            .selector
            .as_ref()
            .and_then(|sel| release.find_asset(sel))
            .ok_or(UpdateError::AssetMissing)?;

        let scratch = self.strategy.scratch_path()?;
        sink.emit(ProgressEvent::new(Phase::Download, 0, "Starting download..."));

        let downloaded = download::download_to_file(
            self.github.http(),
            &asset.browser_download_url,
            &scratch,
            |pct| sink.emit(ProgressEvent::new(Phase::Download, pct, format!("Downloading... {}%", pct))),
        )
        .await;
        if let Err(e) = downloaded {
            let _ = tokio::fs::remove_file(&scratch).await;
            return Err(e);
        }

        sink.emit(ProgressEvent::new(Phase::Installing, 100, "Installing update..."));
        let outcome = match self.strategy.install(&scratch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = tokio::fs::remove_file(&scratch).await;
                return Err(e);
            }
        };

        match &outcome {
            InstallOutcome::InstallerLaunched => {
                sink.emit(ProgressEvent::new(
                    Phase::Done,
                    100,
                    "Installer launched. The app will now close.",
                ));
            }
            InstallOutcome::Replaced { executable, .. } => {
                install::relaunch(executable)?;
                sink.emit(ProgressEvent::new(Phase::Done, 100, "Update installed. Restarting..."));
            }
        }

        tracing::info!("[Updater] Installed {}", release.tag_name);
        Ok(outcome)
    }
}
