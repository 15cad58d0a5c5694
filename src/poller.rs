use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::conversation::Conversation;
use crate::session::{SessionClient, SessionRegistry};

/// Default cadence of the pending-question fallback poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Fallback path for sessions with no live stream attached (page reload,
/// reconnect): periodically asks the server whether execution is paused on a
/// question and surfaces it through the same pending slot the stream fold
/// uses. Suspends itself while a stream is attached or a question is on
/// screen, and survives empty responses and transport errors indefinitely —
/// a question can legitimately arrive many polls after start.
pub struct QuestionPoller {
    client: Arc<SessionClient>,
    registry: Arc<SessionRegistry>,
    conversation: Arc<Mutex<Conversation>>,
    session_id: String,
    interval: Duration,
}

impl QuestionPoller {
    pub fn new(
        client: Arc<SessionClient>,
        registry: Arc<SessionRegistry>,
        conversation: Arc<Mutex<Conversation>>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            registry,
            conversation,
            session_id: session_id.into(),
            interval: POLL_INTERVAL,
        }
    }

    /// Tests shrink the interval; production uses `POLL_INTERVAL`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the owning task is aborted.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if self.registry.has_active(&self.session_id).await {
                continue;
            }
            if self
                .conversation
                .lock()
                .await
                .pending_question()
                .is_some()
            {
                // Already displayed; polling resumes once it is answered.
                continue;
            }

            match self.client.pending_question(&self.session_id).await {
                Ok(Some(question)) => {
                    let mut conversation = self.conversation.lock().await;
                    if conversation.surface_pending(question) {
                        tracing::info!(session_id = %self.session_id, "pending question surfaced by poll");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(session_id = %self.session_id, %err, "pending-question poll failed");
                }
            }
        }
    }
}
