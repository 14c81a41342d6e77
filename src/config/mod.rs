//! 셸 설정과 설치 경로
//!
//! `ShellConfig` 는 `<install_dir>/shell.toml` 에서 읽는다. 파일이 없거나 깨져 있으면
//! 기본값을 쓰고 경고만 남긴다. 환경 변수 `SCDL_LISTEN_ADDR` 가 `listen_addr` 를 덮어쓴다.

pub mod env_file;
pub mod paths;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use paths::AppPaths;

/// 빌드 시 주입되는 릴리스 버전 (`dev` 면 개발 빌드)
pub const BUILD_VERSION: &str = env!("SCDL_BUILD_VERSION");
/// Linux 릴리스 에셋 파일명
pub const LINUX_ASSET_NAME: &str = env!("SCDL_LINUX_ASSET");

pub const LISTEN_ADDR_ENV: &str = "SCDL_LISTEN_ADDR";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    pub worker_host: String,
    pub worker_port: u16,
    pub health_path: String,
    /// 로컬 셸 HTTP 서버 주소 (UI 가 붙는 곳)
    pub listen_addr: String,
    pub instance_addr: String,
    pub startup_timeout_secs: u64,
    /// 0 이면 주기 업데이트 체크 비활성
    pub update_check_interval_hours: u32,
    pub github_owner: String,
    pub github_repo: String,
    pub api_base_url: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            worker_host: "127.0.0.1".to_string(),
            worker_port: 8000,
            health_path: "/api/health".to_string(),
            listen_addr: "127.0.0.1:8800".to_string(),
            instance_addr: crate::single_instance::INSTANCE_ADDR.to_string(),
            startup_timeout_secs: 30,
            update_check_interval_hours: 6,
            github_owner: "svgr-slth".to_string(),
            github_repo: "scdl-webui".to_string(),
            api_base_url: None,
        }
    }
}

impl ShellConfig {
    /// 설정 파일을 읽는다. 실패하면 기본값.
    pub fn load(paths: &AppPaths) -> Self {
        let path = paths.config_file();
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(s) => Self::from_toml_str(&s).unwrap_or_else(|e| {
                tracing::warn!("[Config] Invalid {}: {}; using defaults", path.display(), e);
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!("[Config] Cannot read {}: {}; using defaults", path.display(), e);
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        cfg
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var(LISTEN_ADDR_ENV) {
            if !addr.trim().is_empty() {
                self.listen_addr = addr.trim().to_string();
            }
        }
    }

    /// `127.0.0.1:8000`
    pub fn worker_addr(&self) -> String {
        format!("{}:{}", self.worker_host, self.worker_port)
    }

    pub fn worker_base_url(&self) -> String {
        format!("http://{}", self.worker_addr())
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.worker_base_url(), self.health_path)
    }

    pub fn worker_ws_base(&self) -> String {
        format!("ws://{}", self.worker_addr())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn update_config(&self) -> scdl_desktop_updater_lib::UpdateConfig {
        scdl_desktop_updater_lib::UpdateConfig {
            current_version: BUILD_VERSION.to_string(),
            github_owner: self.github_owner.clone(),
            github_repo: self.github_repo.clone(),
            api_base_url: self.api_base_url.clone(),
            linux_asset_name: LINUX_ASSET_NAME.to_string(),
        }
    }
}
