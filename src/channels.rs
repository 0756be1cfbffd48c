//! UI channel registry and cross-context event envelopes.
//!
//! Every connected UI surface (popup, sidepanel, tab) registers a channel.
//! The registry is the only broadcast fan-out in the crate: senders iterate
//! live channels, isolate per-channel failures, and drop channels that can
//! no longer deliver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::error::ChannelError;
use crate::session::{SessionEvent, SessionManager};

/// Messages pushed from the privileged context to UI surfaces.
///
/// The set is closed: unknown message shapes fail deserialization on the
/// receiving side instead of passing through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UiEvent {
    /// Ask a freshly connected surface to report its token state.
    JwtValidationRequest { timestamp: i64 },
    /// Tear down the authenticated UI immediately.
    ForceLogout { reason: String, timestamp: i64 },
    /// Session expires soon; surfaces should offer an extension prompt.
    SessionWarning { seconds_remaining: u64 },
    SessionExtended,
    SessionExpired,
}

/// Transport seam for a single UI surface.
#[async_trait]
pub trait UiChannel: Send + Sync {
    /// Stable id for this channel (tab id, port name).
    fn id(&self) -> &str;

    /// Deliver one event. Failure means the surface is gone or wedged.
    async fn send(&self, event: &UiEvent) -> Result<(), ChannelError>;
}

/// Registry of connected UI channels.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn UiChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a channel, replacing any previous one with the same id.
    pub async fn register(&self, channel: Arc<dyn UiChannel>) {
        let id = channel.id().to_string();
        tracing::debug!(channel_id = %id, "UI channel connected");
        self.channels.write().await.insert(id, channel);
    }

    /// Remove a channel on disconnect. Unknown ids are ignored.
    pub async fn disconnect(&self, channel_id: &str) {
        if self.channels.write().await.remove(channel_id).is_some() {
            tracing::debug!(channel_id, "UI channel disconnected");
        }
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Send one event to one channel.
    pub async fn send_to(&self, channel_id: &str, event: &UiEvent) -> Result<(), ChannelError> {
        let channel = {
            let guard = self.channels.read().await;
            guard.get(channel_id).cloned()
        };
        let channel = channel.ok_or_else(|| ChannelError::Disconnected {
            channel_id: channel_id.to_string(),
        })?;
        channel.send(event).await
    }

    /// Broadcast to every live channel, returning the delivered count.
    ///
    /// Failures are isolated per channel; a channel that fails to accept the
    /// event is removed from the registry so it cannot wedge later sends.
    pub async fn broadcast(&self, event: &UiEvent) -> usize {
        let channels: Vec<Arc<dyn UiChannel>> = {
            let guard = self.channels.read().await;
            guard.values().cloned().collect()
        };

        if channels.is_empty() {
            tracing::debug!("No connected UI channels for broadcast");
            return 0;
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        for channel in channels {
            match channel.send(event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(channel_id = %channel.id(), "Broadcast delivery failed: {e}");
                    failed.push(channel.id().to_string());
                }
            }
        }

        if !failed.is_empty() {
            let mut guard = self.channels.write().await;
            for id in failed {
                guard.remove(&id);
            }
        }
        delivered
    }
}

/// Forward session lifecycle events to every connected UI surface.
///
/// Warning, extension, and expiry notices cross to the UI as [`UiEvent`]s;
/// internal events (`Started`, `Ended`) stay in-process. The task runs until
/// the session manager is dropped or the handle is aborted.
pub fn forward_session_events(
    session: &Arc<SessionManager>,
    registry: Arc<ChannelRegistry>,
) -> JoinHandle<()> {
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(ui_event) = ui_event_for(&event) {
                        registry.broadcast(&ui_event).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn ui_event_for(event: &SessionEvent) -> Option<UiEvent> {
    match event {
        SessionEvent::Warning { time_remaining, .. } => Some(UiEvent::SessionWarning {
            seconds_remaining: time_remaining.as_secs(),
        }),
        SessionEvent::Extended { .. } => Some(UiEvent::SessionExtended),
        SessionEvent::Expired { .. } => Some(UiEvent::SessionExpired),
        SessionEvent::Started { .. } | SessionEvent::Ended { .. } => None,
    }
}
