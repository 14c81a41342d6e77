//! GitHub Release API 클라이언트
//!
//! `releases/latest` 하나만 조회한다. 에셋 선택 규칙은 플랫폼마다 다르다:
//! Windows 는 이름이 `-installer.exe` 로 끝나는 에셋, 그 외는 빌드 시 지정된
//! 정확한 파일명 (`SCDL_LINUX_ASSET`).

use serde::Deserialize;
use std::time::Duration;

use crate::error::UpdateError;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const USER_AGENT: &str = "scdl-web-updater";
pub const WINDOWS_ASSET_SUFFIX: &str = "-installer.exe";

/// API 요청 타임아웃 (다운로드에는 적용하지 않음)
pub const API_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// GitHub Release 응답 (필요한 필드만)
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

/// 릴리스 에셋 선택 규칙
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSelector {
    /// 파일명이 정확히 일치
    Exact(String),
    /// 파일명이 접미사로 끝남
    Suffix(String),
}

impl AssetSelector {
    /// 현재 OS 에 맞는 규칙. 자체 업데이트를 지원하지 않는 OS 면 None.
    pub fn for_current_platform(linux_asset_name: &str) -> Option<Self> {
        if cfg!(windows) {
            Some(AssetSelector::Suffix(WINDOWS_ASSET_SUFFIX.to_string()))
        } else if cfg!(target_os = "linux") {
            Some(AssetSelector::Exact(linux_asset_name.to_string()))
        } else {
            None
        }
    }

    pub fn matches(&self, asset_name: &str) -> bool {
        match self {
            AssetSelector::Exact(name) => asset_name == name,
            AssetSelector::Suffix(suffix) => asset_name.ends_with(suffix.as_str()),
        }
    }
}

impl Release {
    /// 규칙에 맞는 첫 번째 에셋
    pub fn find_asset(&self, selector: &AssetSelector) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| selector.matches(&a.name))
    }

    pub fn notes(&self) -> String {
        self.body.clone().unwrap_or_default()
    }
}

/// GitHub API 클라이언트
#[derive(Clone)]
pub struct GitHubClient {
    owner: String,
    repo: String,
    http: reqwest::Client,
    base_url: String,
}

impl GitHubClient {
    pub fn new(owner: &str, repo: &str) -> Result<Self, UpdateError> {
        Self::with_base_url(owner, repo, None)
    }

    /// API base URL 을 지정해 생성 (테스트용 mock 서버 등)
    pub fn with_base_url(owner: &str, repo: &str, base_url: Option<&str>) -> Result<Self, UpdateError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpdateError::Check(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            http,
            base_url: base_url
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// 다운로드에 쓰는 HTTP 클라이언트 (같은 User-Agent)
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// 최신 릴리스 가져오기
    pub async fn fetch_latest_release(&self) -> Result<Release, UpdateError> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.base_url, self.owner, self.repo
        );
        tracing::debug!("[Updater] GET {}", url);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| UpdateError::from_reqwest(e, "release lookup", API_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpdateError::Check(format!(
                "GitHub API error ({}): {}",
                status.as_u16(),
                body.trim()
            )));
        }

        response
            .json::<Release>()
            .await
            .map_err(|e| UpdateError::Check(format!("invalid release JSON: {}", e)))
    }
}
