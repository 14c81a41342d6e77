//! 워커 WebSocket 중계
//!
//! ## 모드
//! - **해석 중계** (이 파일): 작업별 워커 엔드포인트(`/ws/sync/{id}`, `/ws/move-library`)에
//!   접속해서 받은 메시지를 그대로 알림 토픽으로 흘린다. `{type:"status", status:<종료값>}`
//!   메시지를 받으면 세션이 끝난다.
//! - **원시 터널** (`tunnel.rs`): UI 의 `/ws/*` 업그레이드 요청을 워커까지 바이트 단위로 잇는다.
//!
//! 같은 키의 세션은 동시에 하나만 산다. 새 요청은 기존 세션을 취소하고, 그 세션의
//! 연결이 닫힌 뒤에 접속한다.

pub mod tunnel;

use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::notify::Notifier;

pub const READY_WAIT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// 새 세션이 이전 세션의 종료를 기다리는 최대 시간
const PREVIOUS_CLOSE_WAIT: Duration = Duration::from_secs(2);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// 접속 실패 시 한 번 보내는 합성 종료 알림
pub const BACKEND_UNAVAILABLE: &str =
    r#"{"type":"status","status":"failed","error":"backend unavailable"}"#;

const SYNC_TERMINAL: &[&str] = &["completed", "failed", "cancelled"];
const MOVE_LIBRARY_TERMINAL: &[&str] = &["completed", "failed"];

/// 중계 대상 작업
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelayKey {
    Sync(u64),
    MoveLibrary,
}

impl RelayKey {
    /// 알림 토픽
    pub fn topic(&self) -> String {
        match self {
            RelayKey::Sync(id) => format!("sync:{}", id),
            RelayKey::MoveLibrary => "move-library".to_string(),
        }
    }

    /// 워커 WebSocket 경로
    pub fn path(&self) -> String {
        match self {
            RelayKey::Sync(id) => format!("/ws/sync/{}", id),
            RelayKey::MoveLibrary => "/ws/move-library".to_string(),
        }
    }

    pub fn terminal_statuses(&self) -> &'static [&'static str] {
        match self {
            RelayKey::Sync(_) => SYNC_TERMINAL,
            RelayKey::MoveLibrary => MOVE_LIBRARY_TERMINAL,
        }
    }
}

impl fmt::Display for RelayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("cannot connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    status: Option<String>,
}

/// 세션을 끝내는 메시지인지
pub fn is_terminal(message: &str, terminal: &[&str]) -> bool {
    match serde_json::from_str::<Envelope>(message) {
        Ok(Envelope { kind: Some(kind), status: Some(status) }) => {
            kind == "status" && terminal.contains(&status.as_str())
        }
        _ => false,
    }
}

/// `watch` 가 돌려주는 준비 신호
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Connected,
    Failed,
    /// 준비 신호를 기다리다 포기 (세션은 계속 진행될 수 있다)
    TimedOut,
}

struct SessionEntry {
    id: u64,
    cancel: CancellationToken,
    /// 세션 태스크가 끝나면 취소된다
    done: CancellationToken,
}

type SessionTable = Arc<Mutex<HashMap<RelayKey, SessionEntry>>>;

pub struct RelayBridge {
    ws_base: String,
    notifier: Arc<dyn Notifier>,
    sessions: SessionTable,
    next_id: AtomicU64,
    ready_wait: Duration,
}

impl RelayBridge {
    /// `ws_base` 예: `ws://127.0.0.1:8000`
    pub fn new(ws_base: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ws_base: ws_base.into(),
            notifier,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            ready_wait: READY_WAIT,
        }
    }

    pub fn with_ready_wait(mut self, wait: Duration) -> Self {
        self.ready_wait = wait;
        self
    }

    /// 세션을 시작하고 연결 성공/실패를 잠깐 기다린다
    pub async fn watch(&self, key: RelayKey) -> WatchOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let previous = {
            let mut sessions = match self.sessions.lock() {
                Ok(s) => s,
                Err(_) => return WatchOutcome::Failed,
            };
            let prev = sessions.insert(
                key.clone(),
                SessionEntry { id, cancel: cancel.clone(), done: done.clone() },
            );
            if let Some(prev) = &prev {
                tracing::info!("[Relay] Replacing live session for {}", key);
                prev.cancel.cancel();
            }
            prev.map(|p| p.done)
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let session = Session {
            id,
            url: format!("{}{}", self.ws_base, key.path()),
            key: key.clone(),
            notifier: self.notifier.clone(),
            sessions: self.sessions.clone(),
            cancel,
        };
        tokio::spawn(async move {
            let _done = done.drop_guard();
            session.run(previous, ready_tx).await;
        });

        match tokio::time::timeout(self.ready_wait, ready_rx).await {
            Ok(Ok(true)) => WatchOutcome::Connected,
            Ok(Ok(false)) | Ok(Err(_)) => WatchOutcome::Failed,
            Err(_) => {
                tracing::warn!("[Relay] Timed out waiting for {} connection", key);
                WatchOutcome::TimedOut
            }
        }
    }

    /// 세션 취소. 없으면 false.
    pub fn stop(&self, key: &RelayKey) -> bool {
        let entry = self.sessions.lock().ok().and_then(|mut s| s.remove(key));
        match entry {
            Some(entry) => {
                tracing::info!("[Relay] Stopping session for {}", key);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let entries: Vec<SessionEntry> = match self.sessions.lock() {
            Ok(mut s) => s.drain().map(|(_, e)| e).collect(),
            Err(_) => return,
        };
        for entry in entries {
            entry.cancel.cancel();
        }
    }

    pub fn is_active(&self, key: &RelayKey) -> bool {
        self.sessions.lock().map(|s| s.contains_key(key)).unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

struct Session {
    id: u64,
    url: String,
    key: RelayKey,
    notifier: Arc<dyn Notifier>,
    sessions: SessionTable,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self, previous: Option<CancellationToken>, ready_tx: oneshot::Sender<bool>) {
        if let Some(prev) = previous {
            let _ = tokio::time::timeout(PREVIOUS_CLOSE_WAIT, prev.cancelled()).await;
        }

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = ready_tx.send(false);
                self.finish();
                return;
            }
            result = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())) => result,
        };

        let mut ws = match connected {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(source)) => {
                self.fail(RelayError::Connect { url: self.url.clone(), source }, ready_tx);
                return;
            }
            Err(_) => {
                self.fail(RelayError::ConnectTimeout(self.url.clone()), ready_tx);
                return;
            }
        };
        tracing::info!("[Relay] Connected {}", self.url);
        let _ = ready_tx.send(true);

        let topic = self.key.topic();
        let terminal = self.key.terminal_statuses();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                    tracing::debug!("[Relay] Session {} cancelled", self.key);
                    break;
                }
                msg = ws.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!("[Relay] Read error on {}: {}", self.key, e);
                            break;
                        }
                    };
                    let finished = is_terminal(&text, terminal);
                    self.notifier.publish(&topic, text);
                    if finished {
                        tracing::info!("[Relay] Session {} reached a terminal status", self.key);
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                        break;
                    }
                }
            }
        }

        self.finish();
    }

    fn fail(&self, err: RelayError, ready_tx: oneshot::Sender<bool>) {
        tracing::warn!("[Relay] {}", err);
        self.notifier.publish(&self.key.topic(), BACKEND_UNAVAILABLE.to_string());
        let _ = ready_tx.send(false);
        self.finish();
    }

    /// 테이블에서 자기 항목만 지운다 (그 사이 교체됐으면 그대로 둔다)
    fn finish(&self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.get(&self.key).is_some_and(|e| e.id == self.id) {
                sessions.remove(&self.key);
            }
        }
    }
}
