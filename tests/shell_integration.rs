//! ═══════════════════════════════════════════════════════════════════
//! 셸 서버 통합 테스트
//! ═══════════════════════════════════════════════════════════════════
//!
//! 실제 TCP 리스너 위에서 셸 서버를 띄우고 확인한다:
//!
//! 1. **프록시** — `/api/*` 가 mock 워커로 전달되는지
//! 2. **SSE** — 발행한 알림이 `/shell/events` 로 나오는지
//! 3. **중계** — watch 요청이 워커 WebSocket 메시지를 알림으로 흘리는지
//! 4. **종료** — shutdown 토큰이 열린 SSE 연결이 있어도 서버를 내리는지

use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use scdl_desktop::ipc::{self, ProxyTarget, ShellState};
use scdl_desktop::notify::{EventBus, Notifier};
use scdl_desktop::platform;
use scdl_desktop::prompt::UiPrompter;
use scdl_desktop::relay::RelayBridge;
use scdl_desktop::supervisor::{ProcessSupervisor, WorkerSpec};

// ═══════════════════════════════════════════════════════
// 테스트 유틸리티
// ═══════════════════════════════════════════════════════

/// `/api/*` 는 axum, `/ws/*` 는 tungstenite 로 받는 mock 워커.
/// 두 리스너를 쓰므로 HTTP 주소와 WebSocket 주소를 따로 돌려준다.
async fn start_mock_worker() -> (SocketAddr, SocketAddr) {
    let app = Router::new()
        .route("/api/health", get(|| async { "ok" }))
        .route("/api/sources", get(|| async { axum::Json(serde_json::json!([{ "id": 1 }])) }));
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(http, app).await.unwrap();
    });

    let ws = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = ws.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let _ = ws.send(Message::Text(r#"{"type":"log","line":"hello"}"#.into())).await;
                let _ = ws
                    .send(Message::Text(r#"{"type":"status","status":"completed"}"#.into()))
                    .await;
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });

    (http_addr, ws_addr)
}

struct Shell {
    addr: SocketAddr,
    bus: EventBus,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

async fn start_shell(http: SocketAddr, ws: SocketAddr) -> Shell {
    let bus = EventBus::default();
    let shutdown = CancellationToken::new();
    let state = ShellState {
        version: "v0.9.0",
        bus: bus.clone(),
        relay: Arc::new(RelayBridge::new(format!("ws://{}", ws), Arc::new(bus.clone()))),
        prompter: Arc::new(UiPrompter::new(bus.clone(), Duration::from_secs(5))),
        worker: Arc::new(ProcessSupervisor::new(
            WorkerSpec::new("/nonexistent/uvicorn", Vec::<String>::new(), "/", "/"),
            format!("http://{}/api/health", http),
            platform::native(),
        )),
        worker_addr: ws,
        proxy: ProxyTarget::new(format!("http://{}", http)).unwrap(),
        updates: None,
        startup_error: Arc::new(RwLock::new(None)),
        shutdown: shutdown.clone(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        ipc::serve(listener, state).await.unwrap();
    });
    Shell { addr, bus, shutdown, server }
}

/// SSE 본문에서 `needle` 이 나올 때까지 읽는다
async fn read_sse_until(resp: reqwest::Response, needle: &str) -> String {
    let mut stream = resp.bytes_stream();
    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !seen.contains(needle) {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("SSE timeout")
            .expect("SSE stream ended")
            .unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    seen
}

// ═══════════════════════════════════════════════════════
// 테스트
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn api_requests_are_proxied_to_worker() {
    let (http, ws) = start_mock_worker().await;
    let shell = start_shell(http, ws).await;

    let resp = reqwest::get(format!("http://{}/api/sources", shell.addr)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body[0]["id"], 1);
}

#[tokio::test]
async fn published_notifications_reach_sse_clients() {
    let (http, ws) = start_mock_worker().await;
    let shell = start_shell(http, ws).await;

    let resp = reqwest::get(format!("http://{}/shell/events", shell.addr)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    shell.bus.publish("update:available", r#"{"available":true}"#.into());

    let seen = read_sse_until(resp, r#"{"available":true}"#).await;
    assert!(seen.contains("event: update:available"));
}

#[tokio::test]
async fn watch_relays_worker_messages_to_events() {
    let (http, ws) = start_mock_worker().await;
    let shell = start_shell(http, ws).await;
    let client = reqwest::Client::new();

    let events = client.get(format!("http://{}/shell/events", shell.addr)).send().await.unwrap();

    let resp = client
        .post(format!("http://{}/shell/sync/12/watch", shell.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "connected");

    let seen = read_sse_until(events, r#""status":"completed""#).await;
    assert!(seen.contains("event: sync:12"));
    assert!(seen.contains(r#"{"type":"log","line":"hello"}"#));
}

#[tokio::test]
async fn shutdown_closes_server_with_open_event_stream() {
    let (http, ws) = start_mock_worker().await;
    let shell = start_shell(http, ws).await;

    let _events = reqwest::get(format!("http://{}/shell/events", shell.addr)).await.unwrap();
    shell.shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(5), shell.server)
        .await
        .expect("server did not stop")
        .unwrap();
}
