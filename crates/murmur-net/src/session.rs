//! Broker session: the producer, consumer and admin channels of one chat
//! participant, opened and closed as a unit.
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`. A session
//! serves a single identity; opening it twice without closing in between
//! is a caller error and is not guarded against.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use murmur_shared::{ConsumerIdentity, ProtocolError, Topic};

use crate::error::{BrokerError, GatewayError, Result};
use crate::transport::{BrokerRecord, BrokerResult, BrokerTransport, ClientChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct BrokerSession {
    transport: Arc<dyn BrokerTransport>,
    connection_timeout: Duration,
    request_timeout: Duration,
    state: Mutex<SessionState>,
}

impl BrokerSession {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        connection_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            connection_timeout,
            request_timeout,
            state: Mutex::new(SessionState::Disconnected),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Connect all channels for `identity` and make sure every chat topic
    /// exists. On failure every channel is closed again and the session is
    /// back to `Disconnected`.
    pub async fn open(&self, identity: &ConsumerIdentity) -> Result<()> {
        self.set_state(SessionState::Connecting);
        info!(group = %identity.group_id(), "Opening broker session");

        if let Err(e) = self.connect_and_prepare(identity).await {
            warn!(group = %identity.group_id(), error = %e, "Broker session failed to open");
            self.close().await;
            return Err(GatewayError::Connection(e));
        }

        self.set_state(SessionState::Connected);
        info!(group = %identity.group_id(), "Broker session connected");
        Ok(())
    }

    async fn connect_and_prepare(&self, identity: &ConsumerIdentity) -> BrokerResult<()> {
        let timeout_ms = self.connection_timeout.as_millis() as u64;
        tokio::time::timeout(
            self.connection_timeout,
            self.transport.connect(identity.group_id()),
        )
        .await
        .map_err(|_| BrokerError::Timeout(timeout_ms))??;

        let topics: Vec<&str> = Topic::ALL.iter().map(Topic::wire_name).collect();
        self.transport.create_topics(&topics).await
    }

    /// Serialize `body` as JSON and publish it on `topic`.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: Topic, body: &T) -> Result<()> {
        let payload = serde_json::to_vec(body).map_err(ProtocolError::from)?;
        self.publish_bytes(topic, payload)
            .await
            .map_err(|source| GatewayError::Publish { source })
    }

    /// Publish an already serialized body.
    pub async fn publish_bytes(&self, topic: Topic, payload: Vec<u8>) -> BrokerResult<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        debug!(topic = %topic, len = payload.len(), "Publishing record");
        self.transport.send(topic.wire_name(), payload).await
    }

    /// Subscribe the consumer to exactly `topics`.
    pub async fn subscribe(&self, topics: &[Topic]) -> Result<mpsc::Receiver<BrokerRecord>> {
        if !self.is_connected() {
            return Err(GatewayError::Subscription(BrokerError::NotConnected));
        }
        let names: Vec<&str> = topics.iter().map(Topic::wire_name).collect();
        self.transport
            .subscribe(&names)
            .await
            .map_err(GatewayError::Subscription)
    }

    /// Best-effort shutdown of every channel. Failures are logged, never
    /// returned; this always completes.
    pub async fn close(&self) {
        for channel in ClientChannel::ALL {
            match tokio::time::timeout(self.request_timeout, self.transport.disconnect(channel))
                .await
            {
                Ok(Ok(())) => debug!(channel = %channel, "Channel disconnected"),
                Ok(Err(e)) => warn!(channel = %channel, error = %e, "Failed to disconnect channel"),
                Err(_) => warn!(channel = %channel, "Timed out disconnecting channel"),
            }
        }
        self.set_state(SessionState::Disconnected);
        info!("Broker session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use murmur_shared::ChatMessage;

    fn session_on(broker: &Arc<MemoryBroker>) -> BrokerSession {
        BrokerSession::new(
            Arc::new(broker.transport()),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_open_creates_all_topics() {
        let broker = MemoryBroker::new();
        let session = session_on(&broker);
        assert_eq!(session.state(), SessionState::Disconnected);

        session
            .open(&ConsumerIdentity::generate("alice"))
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(
            broker.topics(),
            vec!["global-chat", "private-messages", "user-joined", "user-left"]
        );
    }

    #[tokio::test]
    async fn test_open_fails_when_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);
        let session = session_on(&broker);

        let err = session
            .open(&ConsumerIdentity::generate("alice"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Connection(_)));
        assert!(err.is_retryable());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = MemoryBroker::new();
        let session = session_on(&broker);
        let err = session
            .publish(Topic::Broadcast, &ChatMessage::text("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Publish {
                source: BrokerError::NotConnected
            }
        ));
    }

    #[tokio::test]
    async fn test_close_after_close_completes() {
        let broker = MemoryBroker::new();
        let session = session_on(&broker);
        session
            .open(&ConsumerIdentity::generate("bob"))
            .await
            .unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session
            .publish_bytes(Topic::Broadcast, b"{}".to_vec())
            .await
            .is_err());
    }
}
