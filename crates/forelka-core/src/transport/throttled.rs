use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Instant};

use crate::{
    config::TransportConfig,
    domain::{ChatId, MessageRef, UserId},
    transport::{IncomingMessage, TextFormat, TransportSession},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any outbound calls of one session.
    pub global_min_interval: Duration,
    /// Minimum spacing between sends into the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for ThrottleConfig {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            global_min_interval: Duration::from_millis(cfg.global_min_interval_ms),
            per_chat_min_interval: Duration::from_millis(cfg.per_chat_min_interval_ms),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Session decorator that spaces out outbound calls.
///
/// Best-effort flood control; adapters still retry on an explicit rate-limit reply.
pub struct ThrottledSession {
    inner: Arc<dyn TransportSession>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<ChatId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledSession {
    pub fn new(inner: Arc<dyn TransportSession>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: ChatId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl TransportSession for ThrottledSession {
    fn me(&self) -> UserId {
        self.inner.me()
    }

    async fn send(&self, chat_id: ChatId, text: &str, format: TextFormat) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send(chat_id, text, format).await
    }

    async fn create_group(&self, title: &str, members: &[UserId]) -> Result<ChatId> {
        // No chat yet; global spacing only.
        self.throttle_global().await;
        self.inner.create_group(title, members).await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<IncomingMessage>> {
        self.inner.subscribe().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;

    #[test]
    fn limiter_spaces_reservations() {
        let mut lim = IntervalLimiter::new(Duration::from_millis(100));
        assert!(lim.reserve().is_zero());
        let second = lim.reserve();
        assert!(second > Duration::from_millis(50));
        assert!(second <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_to_same_chat_are_spaced() {
        let fake = FakeSession::new(UserId(1));
        let throttled = ThrottledSession::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(10),
                per_chat_min_interval: Duration::from_secs(1),
            },
        );

        let start = Instant::now();
        throttled.send(ChatId(5), "a", TextFormat::Plain).await.unwrap();
        throttled.send(ChatId(5), "b", TextFormat::Plain).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));

        let other = Instant::now();
        throttled.send(ChatId(6), "c", TextFormat::Plain).await.unwrap();
        assert!(other.elapsed() < Duration::from_secs(1));

        assert_eq!(fake.sent_texts(), vec!["a", "b", "c"]);
    }
}
