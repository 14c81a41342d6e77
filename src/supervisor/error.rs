//! 워커 감독 에러

use std::path::PathBuf;
use std::time::Duration;

use super::state_machine::TransitionError;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("worker executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("worker did not become ready within {}s", .0.as_secs())]
    ReadinessTimeout(Duration),

    #[error("worker exited unexpectedly ({0})")]
    Crashed(String),

    #[error(transparent)]
    InvalidState(#[from] TransitionError),

    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// StartError 계열인지 (실행 파일 없음 / exec 실패)
    pub fn is_start_error(&self) -> bool {
        matches!(self, Self::ExecutableNotFound(_) | Self::Spawn { .. })
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ExecutableNotFound(_) => "EXECUTABLE_NOT_FOUND",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::ReadinessTimeout(_) => "READINESS_TIMEOUT",
            Self::Crashed(_) => "CRASHED",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Io(_) => "IO_ERROR",
        }
    }
}
