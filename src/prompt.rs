//! 사용자 확인/경고 창
//!
//! 데스크톱 셸 자체에는 창이 없다. 질문은 `dialog:confirm` 알림으로 UI 에 보내고,
//! UI 가 `POST /shell/dialog/{id}` 로 답한다. `confirm` 은 답이 올 때까지 블로킹하므로
//! 비동기 코드에서는 `spawn_blocking` 안에서 불러야 한다.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::notify::{EventBus, TOPIC_DIALOG_ALERT, TOPIC_DIALOG_CONFIRM};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PromptError {
    #[error("no UI is attached")]
    Unavailable,
    #[error("prompt timed out")]
    TimedOut,
    #[error("prompt was dismissed")]
    Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

pub trait Prompter: Send + Sync {
    /// 예/아니오 질문. 예 = true
    fn confirm(&self, title: &str, message: &str) -> Result<bool, PromptError>;

    fn alert(&self, level: AlertLevel, title: &str, message: &str);
}

#[derive(Serialize)]
struct ConfirmPayload<'a> {
    id: Uuid,
    title: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct AlertPayload<'a> {
    level: AlertLevel,
    title: &'a str,
    message: &'a str,
}

/// UI 알림 채널을 통한 프롬프트
pub struct UiPrompter {
    bus: EventBus,
    pending: Mutex<HashMap<Uuid, mpsc::Sender<bool>>>,
    timeout: Duration,
}

impl UiPrompter {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self { bus, pending: Mutex::new(HashMap::new()), timeout }
    }

    /// UI 의 응답 전달. 대기 중인 질문이 없으면 false.
    pub fn answer(&self, id: Uuid, yes: bool) -> bool {
        let sender = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(yes).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Prompter for UiPrompter {
    fn confirm(&self, title: &str, message: &str) -> Result<bool, PromptError> {
        if self.bus.subscriber_count() == 0 {
            return Err(PromptError::Unavailable);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .map_err(|_| PromptError::Unavailable)?
            .insert(id, tx);

        self.bus.publish_json(TOPIC_DIALOG_CONFIRM, &ConfirmPayload { id, title, message });

        let result = match rx.recv_timeout(self.timeout) {
            Ok(answer) => Ok(answer),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(PromptError::TimedOut),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(PromptError::Dismissed),
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
        result
    }

    fn alert(&self, level: AlertLevel, title: &str, message: &str) {
        match level {
            AlertLevel::Error => tracing::error!("[Dialog] {}: {}", title, message),
            AlertLevel::Warning => tracing::warn!("[Dialog] {}: {}", title, message),
            AlertLevel::Info => tracing::info!("[Dialog] {}: {}", title, message),
        }
        self.bus.publish_json(TOPIC_DIALOG_ALERT, &AlertPayload { level, title, message });
    }
}

/// 항상 같은 답을 돌려주는 프롬프트 (헤드리스 실행, 테스트)
#[derive(Default)]
pub struct FixedPrompter {
    answer: Option<bool>,
    alerts: Mutex<Vec<(AlertLevel, String)>>,
}

impl FixedPrompter {
    /// `None` 이면 모든 질문이 `Unavailable`
    pub fn new(answer: Option<bool>) -> Self {
        Self { answer, alerts: Mutex::new(Vec::new()) }
    }

    /// 받은 경고 (수준, 제목)
    pub fn alerts(&self) -> Vec<(AlertLevel, String)> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Prompter for FixedPrompter {
    fn confirm(&self, _title: &str, _message: &str) -> Result<bool, PromptError> {
        self.answer.ok_or(PromptError::Unavailable)
    }

    fn alert(&self, level: AlertLevel, title: &str, message: &str) {
        tracing::info!("[Dialog] {}: {}", title, message);
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push((level, title.to_string()));
        }
    }
}
