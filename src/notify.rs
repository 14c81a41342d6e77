//! UI 알림 버스
//!
//! 모든 알림은 `{topic, payload}` 쌍이다. payload 는 이미 직렬화된 JSON 문자열로,
//! 워커가 보낸 메시지는 손대지 않고 그대로 싣는다. 구독자는 `/shell/events` SSE 스트림.
//! 느린 구독자는 오래된 알림을 잃는다 (broadcast lagged).

use serde::Serialize;
use tokio::sync::broadcast;

use scdl_desktop_updater_lib::{ProgressEvent, ProgressSink};

pub const DEFAULT_CAPACITY: usize = 256;

pub const TOPIC_UPDATE_PROGRESS: &str = "update:progress";
pub const TOPIC_UPDATE_AVAILABLE: &str = "update:available";
pub const TOPIC_WORKER_CRASHED: &str = "worker:crashed";
pub const TOPIC_DIALOG_CONFIRM: &str = "dialog:confirm";
pub const TOPIC_DIALOG_ALERT: &str = "dialog:alert";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub topic: String,
    pub payload: String,
}

/// 알림 발행 인터페이스
pub trait Notifier: Send + Sync {
    fn publish(&self, topic: &str, payload: String);
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// 값을 JSON 으로 직렬화해서 발행
    pub fn publish_json<T: Serialize>(&self, topic: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(payload) => self.publish(topic, payload),
            Err(e) => tracing::warn!("[Notify] cannot serialize {} payload: {}", topic, e),
        }
    }
}

impl Notifier for EventBus {
    fn publish(&self, topic: &str, payload: String) {
        tracing::trace!("[Notify] {} {}", topic, payload);
        // 구독자가 없으면 버려진다
        let _ = self.tx.send(Notification { topic: topic.to_string(), payload });
    }
}

impl ProgressSink for EventBus {
    fn emit(&self, event: ProgressEvent) {
        self.publish_json(TOPIC_UPDATE_PROGRESS, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scdl_desktop_updater_lib::Phase;

    #[tokio::test]
    async fn subscribers_receive_published_notifications() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish("sync:7", r#"{"type":"progress"}"#.to_string());

        let n = rx.recv().await.unwrap();
        assert_eq!(n.topic, "sync:7");
        assert_eq!(n.payload, r#"{"type":"progress"}"#);
    }

    #[tokio::test]
    async fn progress_events_go_to_update_topic() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(ProgressEvent::new(Phase::Download, 42, "Downloading... 42%"));

        let n = rx.recv().await.unwrap();
        assert_eq!(n.topic, TOPIC_UPDATE_PROGRESS);
        let v: serde_json::Value = serde_json::from_str(&n.payload).unwrap();
        assert_eq!(v["phase"], "download");
        assert_eq!(v["percent"], 42);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish("x", "{}".into());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
