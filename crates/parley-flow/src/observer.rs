//! Observer hooks for flow events
//!
//! Hook failures are logged and swallowed; they never abort a turn.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Receives transitions and agent utterances as they happen.
#[async_trait]
pub trait FlowObserver: Send + Sync {
    /// The session moved to `to` (`from` is `None` when the session starts).
    async fn on_state_change(
        &self,
        _session_id: &str,
        _from: Option<&str>,
        _to: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The agent produced `text` while on `node_id`.
    async fn on_response(&self, _session_id: &str, _node_id: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// User speech cut off agent playback.
    async fn on_interruption(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Events forwarded by [`ChannelObserver`]
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// Session entered a node
    StateChanged {
        session_id: String,
        from: Option<String>,
        to: String,
        timestamp: DateTime<Utc>,
    },

    /// Agent utterance
    Response {
        session_id: String,
        node_id: String,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// User barged in on playback
    Interruption {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Forwards every hook into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<FlowEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: FlowEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow::anyhow!("flow event receiver dropped"))
    }
}

#[async_trait]
impl FlowObserver for ChannelObserver {
    async fn on_state_change(
        &self,
        session_id: &str,
        from: Option<&str>,
        to: &str,
    ) -> anyhow::Result<()> {
        self.send(FlowEvent::StateChanged {
            session_id: session_id.to_string(),
            from: from.map(str::to_string),
            to: to.to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn on_response(&self, session_id: &str, node_id: &str, text: &str) -> anyhow::Result<()> {
        self.send(FlowEvent::Response {
            session_id: session_id.to_string(),
            node_id: node_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn on_interruption(&self, session_id: &str) -> anyhow::Result<()> {
        self.send(FlowEvent::Interruption {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        })
    }
}

/// The observers registered on an engine.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn FlowObserver>>,
}

impl ObserverSet {
    pub fn push(&mut self, observer: Arc<dyn FlowObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub async fn state_change(&self, session_id: &str, from: Option<&str>, to: &str) {
        for observer in &self.observers {
            if let Err(e) = observer.on_state_change(session_id, from, to).await {
                warn!(session_id, error = %e, "State change callback failed");
            }
        }
    }

    pub async fn response(&self, session_id: &str, node_id: &str, text: &str) {
        for observer in &self.observers {
            if let Err(e) = observer.on_response(session_id, node_id, text).await {
                warn!(session_id, node_id, error = %e, "Response callback failed");
            }
        }
    }

    pub async fn interruption(&self, session_id: &str) {
        for observer in &self.observers {
            if let Err(e) = observer.on_interruption(session_id).await {
                warn!(session_id, error = %e, "Interruption callback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl FlowObserver for Failing {
        async fn on_response(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("speaker unplugged")
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_observers() {
        let (channel, mut rx) = ChannelObserver::new();
        let mut set = ObserverSet::default();
        set.push(Arc::new(Failing));
        set.push(Arc::new(channel));

        set.response("s1", "greeting", "Hello").await;
        set.state_change("s1", None, "greeting").await;

        match rx.recv().await {
            Some(FlowEvent::Response { text, .. }) => assert_eq!(text, "Hello"),
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await {
            Some(FlowEvent::StateChanged { from, to, .. }) => {
                assert_eq!(from, None);
                assert_eq!(to, "greeting");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_an_error() {
        let (channel, rx) = ChannelObserver::new();
        drop(rx);
        assert!(channel.on_interruption("s1").await.is_err());
    }
}
