//! 로컬 셸 HTTP 서버 (UI 전송 계층)
//!
//! ## 라우트
//! - `/api/*`                          — 워커로 역방향 프록시 (`proxy.rs`)
//! - `/ws/*`                           — 워커로 원시 터널 (`relay::tunnel`)
//! - `GET  /shell/events`              — 알림 SSE 스트림 (이벤트 이름 = 토픽)
//! - `GET  /shell/status`              — 버전, 워커 상태, 시작 오류
//! - `POST|DELETE /shell/sync/:id/watch`
//! - `POST|DELETE /shell/move-library/watch`
//! - `POST /shell/dialog/:id`          — `{answer}` 대기 중인 확인 창에 응답
//! - `/shell/update/*`                 — `updates.rs`

pub mod proxy;
pub mod updates;

use anyhow::Result;
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{any, get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::notify::{EventBus, Notification};
use crate::prompt::UiPrompter;
use crate::relay::{tunnel, RelayBridge, RelayKey, WatchOutcome};
use crate::supervisor::{ProcessSupervisor, WorkerState};

pub use proxy::ProxyTarget;
pub use updates::UpdateState;

/// 핸들러 공유 상태
#[derive(Clone)]
pub struct ShellState {
    pub version: &'static str,
    pub bus: EventBus,
    pub relay: Arc<RelayBridge>,
    pub prompter: Arc<UiPrompter>,
    pub worker: Arc<ProcessSupervisor>,
    pub worker_addr: SocketAddr,
    pub proxy: ProxyTarget,
    pub updates: Option<UpdateState>,
    /// 시작 실패 설명 (UI 에 표시)
    pub startup_error: Arc<RwLock<Option<String>>>,
    /// 취소되면 SSE 스트림이 닫히고 서버가 내려간다
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub worker_state: WorkerState,
    pub worker_pid: Option<u32>,
    pub startup_error: Option<String>,
    pub relay_sessions: usize,
    pub update_in_progress: bool,
}

#[derive(Debug, Deserialize)]
pub struct DialogAnswer {
    pub answer: bool,
}

pub fn router(state: ShellState) -> Router {
    let mut router = Router::new()
        .route("/shell/events", get(events))
        .route("/shell/status", get(status))
        .route("/shell/sync/:id/watch", post(watch_sync).delete(unwatch_sync))
        .route("/shell/move-library/watch", post(watch_move_library).delete(unwatch_move_library))
        .route("/shell/dialog/:id", post(answer_dialog))
        .route("/ws/*rest", any(ws_tunnel))
        .with_state(state.clone())
        .merge(
            Router::new()
                .route("/api/*rest", any(proxy::forward))
                .with_state(state.proxy.clone()),
        );

    if let Some(updates) = state.updates.clone() {
        router = router.merge(updates::updates_router(updates));
    }
    router.layer(TraceLayer::new_for_http())
}

/// `shutdown` 이 취소될 때까지 서비스
pub async fn serve(listener: TcpListener, state: ShellState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    tracing::info!("[Shell] Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("[Shell] Server stopped");
    Ok(())
}

/// GET /shell/events
async fn events(State(state): State<ShellState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    Sse::new(notification_stream(rx, state.shutdown.clone())).keep_alive(KeepAlive::default())
}

fn notification_stream(
    rx: broadcast::Receiver<Notification>,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold((rx, shutdown), |(mut rx, shutdown)| async move {
        loop {
            // 종료 직전에 발행된 알림(worker:crashed 등)을 먼저 내보낸다
            let received = tokio::select! {
                biased;
                r = rx.recv() => r,
                _ = shutdown.cancelled() => return None,
            };
            match received {
                Ok(n) => {
                    let event = Event::default().event(&n.topic).data(n.payload.replace('\r', ""));
                    return Some((Ok(event), (rx, shutdown)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("[Shell] Event subscriber lagged, {} notifications dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// GET /shell/status
async fn status(State(state): State<ShellState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: state.version.to_string(),
        worker_state: state.worker.state(),
        worker_pid: state.worker.pid(),
        startup_error: state.startup_error.read().await.clone(),
        relay_sessions: state.relay.active_count(),
        update_in_progress: state.updates.as_ref().is_some_and(|u| u.pipeline.is_running()),
    })
}

fn watch_response(key: &RelayKey, outcome: WatchOutcome) -> Response {
    let (status, label) = match outcome {
        WatchOutcome::Connected => (StatusCode::OK, "connected"),
        WatchOutcome::TimedOut => (StatusCode::ACCEPTED, "pending"),
        WatchOutcome::Failed => (StatusCode::BAD_GATEWAY, "failed"),
    };
    (status, Json(json!({ "topic": key.topic(), "status": label }))).into_response()
}

fn unwatch_response(key: &RelayKey, stopped: bool) -> Response {
    let status = if stopped { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (status, Json(json!({ "topic": key.topic(), "stopped": stopped }))).into_response()
}

/// POST /shell/sync/:id/watch
async fn watch_sync(Path(id): Path<u64>, State(state): State<ShellState>) -> Response {
    let key = RelayKey::Sync(id);
    let outcome = state.relay.watch(key.clone()).await;
    watch_response(&key, outcome)
}

/// DELETE /shell/sync/:id/watch
async fn unwatch_sync(Path(id): Path<u64>, State(state): State<ShellState>) -> Response {
    let key = RelayKey::Sync(id);
    unwatch_response(&key, state.relay.stop(&key))
}

async fn watch_move_library(State(state): State<ShellState>) -> Response {
    let outcome = state.relay.watch(RelayKey::MoveLibrary).await;
    watch_response(&RelayKey::MoveLibrary, outcome)
}

async fn unwatch_move_library(State(state): State<ShellState>) -> Response {
    unwatch_response(&RelayKey::MoveLibrary, state.relay.stop(&RelayKey::MoveLibrary))
}

/// POST /shell/dialog/:id
async fn answer_dialog(
    Path(id): Path<Uuid>,
    State(state): State<ShellState>,
    Json(body): Json<DialogAnswer>,
) -> impl IntoResponse {
    if state.prompter.answer(id, body.answer) {
        (StatusCode::OK, Json(json!({ "ok": true })))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "ok": false, "error": "no pending dialog" })))
    }
}

async fn ws_tunnel(State(state): State<ShellState>, req: Request) -> Response {
    tunnel::forward(state.worker_addr, req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::platform;
    use crate::supervisor::WorkerSpec;
    use axum::body::Body;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> ShellState {
        let bus = EventBus::default();
        let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
        ShellState {
            version: "v1.2.3",
            bus: bus.clone(),
            relay: Arc::new(RelayBridge::new(format!("ws://{}", unused), Arc::new(bus.clone()))),
            prompter: Arc::new(UiPrompter::new(bus.clone(), Duration::from_secs(5))),
            worker: Arc::new(ProcessSupervisor::new(
                WorkerSpec::new("/nonexistent/uvicorn", Vec::<String>::new(), "/", "/"),
                format!("http://{}/api/health", unused),
                platform::native(),
            )),
            worker_addr: unused,
            proxy: ProxyTarget::new(format!("http://{}", unused)).unwrap(),
            updates: None,
            startup_error: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn status_reports_version_and_worker_state() {
        let state = test_state();
        *state.startup_error.write().await = Some("Backend Timeout".into());

        let req = axum::http::Request::get("/shell/status").body(Body::empty()).unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let v = body_json(resp).await;
        assert_eq!(v["version"], "v1.2.3");
        assert_eq!(v["worker_state"], "not_started");
        assert_eq!(v["startup_error"], "Backend Timeout");
        assert_eq!(v["relay_sessions"], 0);
    }

    #[tokio::test]
    async fn unknown_dialog_is_not_found() {
        let req = axum::http::Request::post(format!("/shell/dialog/{}", Uuid::new_v4()))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"answer":true}"#))
            .unwrap();
        let resp = router(test_state()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unwatch_without_session_is_not_found() {
        let req = axum::http::Request::delete("/shell/sync/4/watch").body(Body::empty()).unwrap();
        let resp = router(test_state()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["topic"], "sync:4");
    }

    #[tokio::test]
    async fn watch_against_dead_worker_fails() {
        let req = axum::http::Request::post("/shell/move-library/watch").body(Body::empty()).unwrap();
        let resp = router(test_state()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(resp).await["status"], "failed");
    }

    #[tokio::test]
    async fn event_stream_yields_notifications_and_ends_on_shutdown() {
        use futures_util::StreamExt;

        let bus = EventBus::default();
        let shutdown = CancellationToken::new();
        let mut stream = Box::pin(notification_stream(bus.subscribe(), shutdown.clone()));

        bus.publish("sync:1", r#"{"type":"progress"}"#.into());
        let first = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap();
        assert!(first.is_some());

        shutdown.cancel();
        let end = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn queued_notifications_are_delivered_before_shutdown_ends_the_stream() {
        use futures_util::StreamExt;

        for _ in 0..50 {
            let bus = EventBus::default();
            let shutdown = CancellationToken::new();
            let mut stream = Box::pin(notification_stream(bus.subscribe(), shutdown.clone()));

            bus.publish("worker:crashed", r#"{"code":1}"#.into());
            bus.publish("dialog:alert", r#"{"title":"Backend Stopped"}"#.into());
            shutdown.cancel();

            assert!(stream.next().await.is_some());
            assert!(stream.next().await.is_some());
            assert!(stream.next().await.is_none());
        }
    }
}
