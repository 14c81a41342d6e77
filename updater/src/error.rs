//! 업데이트 파이프라인 에러
//!
//! 각 변형의 Display 문자열은 그대로 `update:progress` 의 `error` 메시지로 나간다.

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    /// 릴리스 정보 조회 실패 (네트워크, HTTP 상태, JSON)
    #[error("Failed to fetch release info: {0}")]
    Check(String),

    /// 현재 플랫폼에 맞는 에셋이 릴리스에 없음
    #[error("No update asset found for this platform")]
    AssetMissing,

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Failed to install update: {0}")]
    Install(String),

    /// 설치는 끝났지만 새 바이너리를 띄우지 못함
    #[error("Update installed but failed to restart: {0}")]
    Relaunch(String),

    /// 이미 다른 다운로드/설치가 진행 중
    #[error("Update already in progress")]
    AlreadyRunning,
}

impl UpdateError {
    /// reqwest 에러를 작업 단계에 맞게 분류
    pub fn from_reqwest(err: reqwest::Error, operation: &str, timeout: Duration) -> Self {
        let message = if err.is_timeout() {
            format!("{} timed out after {}s", operation, timeout.as_secs())
        } else if err.is_connect() {
            format!("{}: connection failed: {}", operation, err)
        } else if let Some(status) = err.status() {
            format!("{}: HTTP {}", operation, status.as_u16())
        } else {
            format!("{}: {}", operation, err)
        };

        if operation.starts_with("download") {
            UpdateError::Download(message)
        } else {
            UpdateError::Check(message)
        }
    }

    /// 에러 분류 코드 (로그/IPC 응답용)
    pub fn error_code(&self) -> &'static str {
        match self {
            UpdateError::Check(_) => "check_failed",
            UpdateError::AssetMissing => "asset_missing",
            UpdateError::Download(_) => "download_failed",
            UpdateError::Install(_) => "install_failed",
            UpdateError::Relaunch(_) => "relaunch_failed",
            UpdateError::AlreadyRunning => "already_running",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_progress_wording() {
        assert_eq!(
            UpdateError::Check("HTTP 500".into()).to_string(),
            "Failed to fetch release info: HTTP 500"
        );
        assert_eq!(
            UpdateError::AssetMissing.to_string(),
            "No update asset found for this platform"
        );
        assert_eq!(UpdateError::AlreadyRunning.error_code(), "already_running");
    }
}
