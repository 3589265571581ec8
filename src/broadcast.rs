//! Cross-tab sign-in/sign-out notifications.
//!
//! Tabs of one origin share a [`BroadcastHub`]. Each tab opens its own
//! [`TabChannel`] on the session topic; an announcement reaches every other
//! tab on the topic but never the tab that sent it.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Topic every tab of the application listens on
pub const SESSION_TOPIC: &str = "authrkst.session";

/// Messages buffered per topic before slow tabs start lagging
const CHANNEL_CAPACITY: usize = 64;

/// Session transition announced to sibling tabs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastEvent {
    #[serde(rename = "signIn")]
    SignedIn,
    #[serde(rename = "signOut")]
    SignedOut,
}

impl BroadcastEvent {
    /// Wire payload
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastEvent::SignedIn => "signIn",
            BroadcastEvent::SignedOut => "signOut",
        }
    }

    pub fn parse(payload: &str) -> Option<Self> {
        match payload {
            "signIn" => Some(BroadcastEvent::SignedIn),
            "signOut" => Some(BroadcastEvent::SignedOut),
            _ => None,
        }
    }
}

/// Callback fired for each event announced by another tab
pub type EventHandler = Box<dyn Fn(BroadcastEvent) + Send + Sync>;

/// Cross-tab channel capability handed to a tab
pub trait SessionChannel: Send + Sync {
    /// Notify every other tab
    fn announce(&self, event: BroadcastEvent);

    /// Run `handler` for every event another tab announces from now on
    fn on_event(&self, handler: EventHandler);
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    payload: String,
}

/// Shared bus connecting the tabs of one origin
#[derive(Clone, Default)]
pub struct BroadcastHub {
    topics: Arc<DashMap<String, broadcast::Sender<Envelope>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for a new tab on `topic`
    pub fn open(&self, topic: &str) -> TabChannel {
        let sender = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        TabChannel {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            sender,
        }
    }

    /// Open a channel on the session topic
    pub fn open_session(&self) -> TabChannel {
        self.open(SESSION_TOPIC)
    }
}

/// One tab's end of a topic
pub struct TabChannel {
    id: Uuid,
    topic: String,
    sender: broadcast::Sender<Envelope>,
}

impl TabChannel {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl SessionChannel for TabChannel {
    fn announce(&self, event: BroadcastEvent) {
        let envelope = Envelope {
            origin: self.id,
            payload: event.as_str().to_string(),
        };

        match self.sender.send(envelope) {
            Ok(receivers) => tracing::debug!(
                topic = %self.topic,
                event = event.as_str(),
                receivers,
                "Announced session event"
            ),
            Err(_) => tracing::debug!(
                topic = %self.topic,
                event = event.as_str(),
                "No tab listening for session event"
            ),
        }
    }

    fn on_event(&self, handler: EventHandler) {
        // Subscribe before spawning so nothing announced after this call is missed
        let mut receiver = self.sender.subscribe();
        let id = self.id;
        let topic = self.topic.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) if envelope.origin == id => continue,
                    Ok(envelope) => match BroadcastEvent::parse(&envelope.payload) {
                        Some(event) => handler(event),
                        None => tracing::warn!(
                            topic = %topic,
                            payload = %envelope.payload,
                            "Ignoring unknown session event"
                        ),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(topic = %topic, skipped, "Session listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn listen(channel: &TabChannel) -> mpsc::UnboundedReceiver<BroadcastEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.on_event(Box::new(move |event| {
            let _ = tx.send(event);
        }));
        rx
    }

    #[test]
    fn test_event_payloads() {
        assert_eq!(BroadcastEvent::SignedIn.as_str(), "signIn");
        assert_eq!(BroadcastEvent::SignedOut.as_str(), "signOut");
        assert_eq!(BroadcastEvent::parse("signOut"), Some(BroadcastEvent::SignedOut));
        assert_eq!(BroadcastEvent::parse("logout"), None);
        assert_eq!(
            serde_json::to_string(&BroadcastEvent::SignedIn).unwrap(),
            "\"signIn\""
        );
    }

    #[tokio::test]
    async fn test_other_tabs_receive_sender_does_not() {
        let hub = BroadcastHub::new();
        let tab_a = hub.open_session();
        let tab_b = hub.open_session();
        let tab_c = hub.open_session();

        let mut from_a = listen(&tab_a);
        let mut from_b = listen(&tab_b);
        let mut from_c = listen(&tab_c);

        tab_a.announce(BroadcastEvent::SignedOut);

        let timeout = Duration::from_secs(1);
        assert_eq!(
            tokio::time::timeout(timeout, from_b.recv()).await.unwrap(),
            Some(BroadcastEvent::SignedOut)
        );
        assert_eq!(
            tokio::time::timeout(timeout, from_c.recv()).await.unwrap(),
            Some(BroadcastEvent::SignedOut)
        );
        assert!(tokio::time::timeout(Duration::from_millis(100), from_a.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = BroadcastHub::new();
        let tab_a = hub.open("app-one");
        let tab_b = hub.open("app-two");
        let mut from_b = listen(&tab_b);

        tab_a.announce(BroadcastEvent::SignedIn);

        assert!(tokio::time::timeout(Duration::from_millis(100), from_b.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_announce_without_listeners_is_harmless() {
        let hub = BroadcastHub::new();
        let tab = hub.open_session();
        tab.announce(BroadcastEvent::SignedIn);
        assert_eq!(tab.topic(), SESSION_TOPIC);
    }
}
