use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

/// Push event fanned out to every connected UI window.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AppEvent {
    /// A deep link classified as an auth callback is being resolved.
    AuthCallbackUrl { id: String, url: String },
    /// The shared auth state changed; the UI should re-read its snapshot.
    AuthChanged { id: String, signed_in: bool },
    /// The active app session changed (started, renewed, or ended).
    SessionChanged {
        id: String,
        session_id: Option<String>,
    },
}

impl AppEvent {
    pub fn auth_callback_url(url: impl Into<String>) -> Self {
        Self::AuthCallbackUrl {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
        }
    }

    pub fn auth_changed(signed_in: bool) -> Self {
        Self::AuthChanged {
            id: Uuid::new_v4().to_string(),
            signed_in,
        }
    }

    pub fn session_changed(session_id: Option<String>) -> Self {
        Self::SessionChanged {
            id: Uuid::new_v4().to_string(),
            session_id,
        }
    }
}

/// Broadcast hub for [`AppEvent`]s. Publishing with no subscribers is fine;
/// the UI may not have connected yet.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<AppEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: AppEvent) {
        if let Err(err) = self.sender.send(event) {
            debug!("no subscribers for event broadcast: {err}");
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let hub = EventHub::new();
        let mut receiver = hub.subscribe();

        hub.publish(AppEvent::auth_callback_url("pulseboard://auth?code=1"));

        let event = receiver.recv().await.unwrap();
        match event {
            AppEvent::AuthCallbackUrl { url, id } => {
                assert_eq!(url, "pulseboard://auth?code=1");
                assert_eq!(id.len(), 36);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let hub = EventHub::new();
        hub.publish(AppEvent::session_changed(None));
    }

    #[test]
    fn events_serialize_with_kebab_case_kind() {
        let encoded =
            serde_json::to_string(&AppEvent::auth_changed(true)).unwrap();
        assert!(encoded.contains("\"kind\":\"auth-changed\""));
        assert!(encoded.contains("\"signed_in\":true"));
    }
}
