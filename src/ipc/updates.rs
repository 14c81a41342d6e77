//! 셸 업데이트 API: `/shell/update/*`
//!
//! ## 엔드포인트
//! - `POST /shell/update/check`   — 최신 릴리스 확인 (실패는 "업데이트 없음")
//! - `POST /shell/update/install` — `{version}` 다운로드+설치를 백그라운드로 시작
//!
//! 진행 상황은 `update:progress` 알림으로만 나간다. 설치가 끝나면 `quit` 토큰을
//! 취소해서 앱이 워커를 정리하고 종료하게 한다.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use scdl_desktop_updater_lib::{ProgressSink, UpdateError, UpdatePipeline};

use crate::notify::EventBus;

/// 설치 완료 알림이 UI 에 닿을 시간
const QUIT_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct UpdateState {
    pub pipeline: Arc<UpdatePipeline>,
    pub bus: EventBus,
    pub quit: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    #[serde(default)]
    pub version: String,
}

pub fn updates_router(state: UpdateState) -> Router {
    Router::new()
        .route("/shell/update/check", post(check_update))
        .route("/shell/update/install", post(install_update))
        .with_state(state)
}

/// POST /shell/update/check
async fn check_update(State(state): State<UpdateState>) -> impl IntoResponse {
    Json(state.pipeline.check_for_update().await)
}

/// POST /shell/update/install — 즉시 응답하고 설치는 백그라운드에서
async fn install_update(
    State(state): State<UpdateState>,
    Json(req): Json<InstallRequest>,
) -> impl IntoResponse {
    let sink: Arc<dyn ProgressSink> = Arc::new(state.bus.clone());
    let handle = match state.pipeline.spawn_download_and_install(req.version.clone(), sink) {
        Ok(handle) => handle,
        Err(e) => {
            let status = match e {
                UpdateError::AlreadyRunning => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return (status, Json(json!({ "ok": false, "error": e.to_string(), "code": e.error_code() })));
        }
    };

    tracing::info!("[Updater] Install requested for {}", if req.version.is_empty() { "latest" } else { &req.version });
    let quit = state.quit.clone();
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(outcome)) => {
                tracing::info!("[Updater] Install finished ({:?}), shutting down", outcome);
                tokio::time::sleep(QUIT_DELAY).await;
                quit.cancel();
            }
            // 실패는 이미 error 단계 알림으로 나갔다. 현재 버전은 그대로 돈다.
            Ok(Err(_)) => {}
            Err(e) => tracing::error!("[Updater] Install task panicked: {}", e),
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "ok": true })))
}
