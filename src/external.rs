//! Boundary to the scraping-based external messaging collaborator.
//!
//! The collaborator logs into a third-party website with a browser
//! session and delivers or reads messages there. Its internals
//! (HTML/CSRF scraping) live outside this crate; the core sees exactly
//! two async operations. The site is slow, unreliable, and rate
//! limited, so [`MessageGateway`] serializes every call — one scraping
//! session at a time, with a cooldown between consecutive calls.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;

/// Cooldown between consecutive collaborator calls.
pub const CALL_COOLDOWN: Duration = Duration::from_secs(1);

/// A message fetched back from the external site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub content: String,
}

/// Collaborator failures carry only a human-readable message; the site
/// gives us nothing more structured.
#[derive(Debug)]
pub struct MessengerError(pub String);

impl std::fmt::Display for MessengerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "External messenger error: {}", self.0)
    }
}

impl std::error::Error for MessengerError {}

pub type MessengerResult<T> = Result<T, MessengerError>;

/// The two operations the scraping component exposes to the core.
pub trait ExternalMessenger: Send + Sync {
    /// Deliver `text` to `target_user` on the external site.
    fn send_message(
        &self,
        session_uid: &str,
        session_cookie: &str,
        target_user: &str,
        text: &str,
    ) -> impl Future<Output = MessengerResult<()>> + Send;

    /// Fetch the latest message received from `target_user`.
    fn fetch_latest_message(
        &self,
        session_uid: &str,
        session_cookie: &str,
        target_user: &str,
    ) -> impl Future<Output = MessengerResult<FetchedMessage>> + Send;
}

/// Serializing front for an [`ExternalMessenger`]. The slot mutex is
/// fair, so queued callers proceed in arrival order; the cooldown is
/// spent while still holding the slot, spacing consecutive site hits.
pub struct MessageGateway<M> {
    messenger: M,
    slot: Mutex<()>,
    cooldown: Duration,
}

impl<M: ExternalMessenger> MessageGateway<M> {
    pub fn new(messenger: M) -> Self {
        Self::with_cooldown(messenger, CALL_COOLDOWN)
    }

    pub fn with_cooldown(messenger: M, cooldown: Duration) -> Self {
        MessageGateway {
            messenger,
            slot: Mutex::new(()),
            cooldown,
        }
    }

    pub async fn send_message(
        &self,
        session_uid: &str,
        session_cookie: &str,
        target_user: &str,
        text: &str,
    ) -> MessengerResult<()> {
        let _slot = self.slot.lock().await;
        let result = self
            .messenger
            .send_message(session_uid, session_cookie, target_user, text)
            .await;
        tokio::time::sleep(self.cooldown).await;
        result
    }

    pub async fn fetch_latest_message(
        &self,
        session_uid: &str,
        session_cookie: &str,
        target_user: &str,
    ) -> MessengerResult<FetchedMessage> {
        let _slot = self.slot.lock().await;
        let result = self
            .messenger
            .fetch_latest_message(session_uid, session_cookie, target_user)
            .await;
        tokio::time::sleep(self.cooldown).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct MockMessenger {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ExternalMessenger for MockMessenger {
        fn send_message(
            &self,
            _session_uid: &str,
            _session_cookie: &str,
            _target_user: &str,
            _text: &str,
        ) -> impl Future<Output = MessengerResult<()>> + Send {
            async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        fn fetch_latest_message(
            &self,
            _session_uid: &str,
            _session_cookie: &str,
            target_user: &str,
        ) -> impl Future<Output = MessengerResult<FetchedMessage>> + Send {
            let content = format!("from {}", target_user);
            async move { Ok(FetchedMessage { content }) }
        }
    }

    #[tokio::test]
    async fn test_calls_never_overlap() {
        let gateway = Arc::new(MessageGateway::with_cooldown(
            MockMessenger::default(),
            Duration::from_millis(10),
        ));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let gw = Arc::clone(&gateway);
            tasks.push(tokio::spawn(async move {
                gw.send_message("uid", "cookie", &format!("user{}", i), "hello")
                    .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(gateway.messenger.calls.load(Ordering::SeqCst), 4);
        assert_eq!(gateway.messenger.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_round_trip() {
        let gateway =
            MessageGateway::with_cooldown(MockMessenger::default(), Duration::from_millis(1));
        let msg = gateway
            .fetch_latest_message("uid", "cookie", "friend")
            .await
            .unwrap();
        assert_eq!(msg.content, "from friend");
    }
}
