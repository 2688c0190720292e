//! Backend-initiated reconnect notifications.
//!
//! The backend can ask a client to re-subscribe to its jobs, e.g. after
//! it restarted a worker. [`NotificationListener`] keeps a notification
//! channel open for the client's session id (retrying with backoff for
//! as long as it runs) and reattaches every tracked job when a
//! `reconnect` notification for that session arrives.
//!
//! A channel that drops is reopened after the next backoff delay. The
//! delay only starts over once a channel stayed up for
//! [`STABLE_SESSION`].

use std::sync::Arc;
use std::time::Duration;

use afe_core::types::JobId;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{Channel, Transport, TransportError, WsTransport};
use crate::manager::JobTracker;
use crate::messages::OutboundFrame;
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// A message pushed on the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Reconnect {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// A notification channel that stayed open this long resets the backoff.
pub const STABLE_SESSION: Duration = Duration::from_secs(60);

pub fn parse_notification(text: &str) -> Result<Notification, serde_json::Error> {
    serde_json::from_str(text)
}

pub struct NotificationListener {
    transport: Arc<dyn Transport>,
    target: String,
    session_id: String,
    reconnect: ReconnectConfig,
}

impl NotificationListener {
    /// Listen on `url` (see
    /// [`TrackerConfig::notifications_ws_url`](crate::config::TrackerConfig::notifications_ws_url)).
    pub fn new(url: impl Into<String>, session_id: impl Into<String>) -> Self {
        let url = url.into();
        Self::with_transport(
            Arc::new(WsTransport::new(url.clone())),
            url,
            session_id,
            ReconnectConfig::default(),
        )
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        target: impl Into<String>,
        session_id: impl Into<String>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            transport,
            target: target.into(),
            session_id: session_id.into(),
            reconnect,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run until `cancel` fires. The channel is reopened, after a backoff
    /// delay, whenever it drops.
    pub async fn run(&self, tracker: Arc<JobTracker>, cancel: CancellationToken) {
        let mut drops = 0u32;
        loop {
            let opened =
                reconnect_loop(&self.target, &self.reconnect, &cancel, || self.open()).await;
            let Some(mut channel) = opened else {
                return;
            };
            let opened_at = Instant::now();

            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => {
                        channel.close().await;
                        return;
                    }
                    frame = channel.recv() => frame,
                };

                match frame {
                    Some(Ok(text)) => match parse_notification(&text) {
                        Ok(notification) => {
                            self.handle_notification(&tracker, notification).await;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Ignoring malformed notification");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %self.session_id, error = %e, "Notification channel error");
                        break;
                    }
                    None => {
                        tracing::info!(session_id = %self.session_id, "Notification channel closed");
                        break;
                    }
                }
            }

            if opened_at.elapsed() >= STABLE_SESSION {
                drops = 0;
            }
            let delay = self.reconnect.delay_for_attempt(drops);
            drops = drops.saturating_add(1);
            tracing::info!(
                session_id = %self.session_id,
                drops,
                delay_ms = delay.as_millis() as u64,
                "Reopening notification channel after delay",
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// React to one notification. Returns the jobs that were reattached.
    pub async fn handle_notification(
        &self,
        tracker: &JobTracker,
        notification: Notification,
    ) -> Vec<JobId> {
        let Notification::Reconnect {
            session_id: Some(session_id),
        } = notification
        else {
            return Vec::new();
        };
        if session_id != self.session_id {
            tracing::debug!(%session_id, "Reconnect notification for another session");
            return Vec::new();
        }

        tracing::info!(%session_id, "Reconnect requested by backend");
        let mut reattached = Vec::new();
        for job_id in tracker.tracked_jobs().await {
            match tracker.reattach(&job_id).await {
                Ok(()) => reattached.push(job_id),
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to reattach"),
            }
        }
        reattached
    }

    async fn open(&self) -> Result<Box<dyn Channel>, TransportError> {
        let mut channel = self.transport.open().await?;
        channel
            .send(OutboundFrame::SessionId(self.session_id.clone()))
            .await?;
        Ok(channel)
    }
}
