//! 업데이트 스케줄러
//!
//! - `check_once`: 원샷 체크 (CLI `check-update`, IPC `/shell/update/check`)
//! - `spawn_periodic`: 설정 간격마다 체크하고, 업데이트가 있으면 콜백 호출
//!
//! 첫 체크는 시작 직후가 아니라 `initial_delay` 뒤에 한다 (기본 30초).

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{UpdateInfo, UpdatePipeline};

/// 스케줄러 설정
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 체크 간격 (시간 단위). 0 이면 주기 체크를 하지 않는다.
    pub interval_hours: u32,
    /// 시작 후 첫 체크까지의 지연
    pub initial_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            initial_delay: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn enabled(&self) -> bool {
        self.interval_hours > 0
    }

    /// 체크 간격을 Duration으로 변환
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval_hours as u64 * 3600)
    }
}

/// 원샷 업데이트 체크 결과
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckResult {
    pub available: bool,
    pub current_version: String,
    pub latest_version: Option<String>,
    pub notes: Option<String>,
    /// 오류 메시지 (있으면)
    pub error: Option<String>,
}

/// 한 번 체크하고 결과를 반환한다. 실패는 `error` 에 담는다.
pub async fn check_once(pipeline: &UpdatePipeline) -> CheckResult {
    let current_version = pipeline.config().current_version.clone();
    tracing::info!("[Updater] Running one-shot update check ({})", current_version);

    match pipeline.try_check().await {
        Ok(info) if info.available => CheckResult {
            available: true,
            current_version,
            latest_version: Some(info.version),
            notes: Some(info.notes),
            error: None,
        },
        Ok(_) => CheckResult {
            available: false,
            current_version,
            latest_version: None,
            notes: None,
            error: None,
        },
        Err(e) => {
            tracing::error!("[Updater] Check failed: {}", e);
            CheckResult {
                available: false,
                current_version,
                latest_version: None,
                notes: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// 체크 결과를 JSON 문자열로 직렬화
pub fn result_to_json(result: &CheckResult) -> String {
    serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string())
}

/// 프로세스 종료 코드 결정
///
/// - `0` — 업데이트 있음
/// - `1` — 체크 실패
/// - `2` — 업데이트 없음
pub fn exit_code(result: &CheckResult) -> i32 {
    if result.error.is_some() {
        1
    } else if result.available {
        0
    } else {
        2
    }
}

/// 주기 체크 태스크. `cancel` 이 취소되면 끝난다. 비활성 설정이면 None.
pub fn spawn_periodic<F>(
    pipeline: Arc<UpdatePipeline>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    on_available: F,
) -> Option<tokio::task::JoinHandle<()>>
where
    F: Fn(UpdateInfo) + Send + Sync + 'static,
{
    if !config.enabled() {
        tracing::info!("[Updater] Periodic update checks disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut delay = config.initial_delay;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let info = pipeline.check_for_update().await;
            if info.available {
                on_available(info);
            }
            delay = config.interval_duration();
        }
        tracing::debug!("[Updater] Periodic update checks stopped");
    }))
}
