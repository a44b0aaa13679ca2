use super::{OutboundEnvelope, SharedBus, Transport, TransportEvent, TransportState};
use crate::model::Credential;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Default)]
struct LoopbackState {
    connected: bool,
    reachable: bool,
    fail_sends: bool,
    connect_calls: u32,
    sent: Vec<OutboundEnvelope>,
}

/// In-process transport. Records sends and lets the caller play the role
/// of the phone: link, drop, or inject inbound traffic.
///
/// With `auto_link` set, a fresh connect links immediately after issuing a
/// challenge, which is handy for local demos.
pub struct LoopbackTransport {
    bus: SharedBus,
    phone: String,
    auto_link: bool,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new(bus: SharedBus, phone: impl Into<String>, auto_link: bool) -> Self {
        Self {
            bus,
            phone: phone.into(),
            auto_link,
            state: Mutex::new(LoopbackState {
                reachable: true,
                ..LoopbackState::default()
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LoopbackState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub async fn inject(&self, event: TransportEvent) -> Result<()> {
        self.bus.lock().await.publish(event).await
    }

    /// Simulate a contact writing to us.
    pub async fn receive(&self, contact_id: &str, body: &str) -> Result<()> {
        self.inject(TransportEvent::InboundMessage {
            contact_id: contact_id.to_string(),
            body: body.to_string(),
            timestamp: Some(chrono::Utc::now()),
        })
        .await
    }

    /// Simulate the operator scanning the challenge.
    pub async fn link(&self) -> Result<()> {
        let credential = Credential(format!("loopback-{}", uuid::Uuid::new_v4()));
        self.with_state(|s| s.connected = true);
        self.inject(TransportEvent::ConnectionStateChanged {
            state: TransportState::Connected {
                phone: self.phone.clone(),
                credential,
            },
        })
        .await
    }

    pub async fn reject(&self, reason: &str) -> Result<()> {
        self.with_state(|s| s.connected = false);
        self.inject(TransportEvent::ConnectionStateChanged {
            state: TransportState::Rejected {
                reason: reason.to_string(),
            },
        })
        .await
    }

    /// Simulate an unsolicited connection drop.
    pub async fn drop_connection(&self, reason: &str) -> Result<()> {
        self.with_state(|s| s.connected = false);
        self.inject(TransportEvent::ConnectionStateChanged {
            state: TransportState::Closed {
                reason: reason.to_string(),
            },
        })
        .await
    }

    /// While unreachable every `connect` fails immediately.
    pub fn set_reachable(&self, reachable: bool) {
        self.with_state(|s| s.reachable = reachable);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.with_state(|s| s.fail_sends = fail);
    }

    pub fn sent(&self) -> Vec<OutboundEnvelope> {
        self.with_state(|s| s.sent.clone())
    }

    pub fn connect_calls(&self) -> u32 {
        self.with_state(|s| s.connect_calls)
    }

    pub fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self, credential: Option<&Credential>) -> Result<()> {
        let reachable = self.with_state(|s| {
            s.connect_calls += 1;
            s.reachable
        });
        if !reachable {
            return Err(anyhow::anyhow!("loopback transport unreachable"));
        }

        if let Some(credential) = credential {
            debug!("loopback resuming with stored credential");
            self.with_state(|s| s.connected = true);
            return self
                .inject(TransportEvent::ConnectionStateChanged {
                    state: TransportState::Connected {
                        phone: self.phone.clone(),
                        credential: credential.clone(),
                    },
                })
                .await;
        }

        let payload = format!("2@{}", uuid::Uuid::new_v4().simple());
        self.inject(TransportEvent::CredentialChallenge { payload })
            .await?;
        if self.auto_link {
            info!("loopback auto-linking as {}", self.phone);
            self.link().await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.with_state(|s| s.connected = false);
        Ok(())
    }

    async fn send(&self, envelope: &OutboundEnvelope) -> Result<()> {
        self.with_state(|s| {
            if !s.connected {
                return Err(anyhow::anyhow!("loopback transport not connected"));
            }
            if s.fail_sends {
                return Err(anyhow::anyhow!("loopback send failed"));
            }
            s.sent.push(envelope.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TransportBus;
    use crate::model::{ContactId, MessageId};
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    fn setup(auto_link: bool) -> (
        LoopbackTransport,
        tokio::sync::mpsc::Receiver<TransportEvent>,
    ) {
        let mut bus = TransportBus::default();
        let rx = bus.take_rx().unwrap();
        let transport =
            LoopbackTransport::new(Arc::new(AsyncMutex::new(bus)), "5511900000000", auto_link);
        (transport, rx)
    }

    fn envelope() -> OutboundEnvelope {
        OutboundEnvelope {
            message_id: MessageId::from("m1"),
            contact_id: ContactId::from("5511999991234"),
            body: "olá".into(),
        }
    }

    #[tokio::test]
    async fn test_fresh_connect_issues_challenge() {
        let (transport, mut rx) = setup(false);
        transport.connect(None).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::CredentialChallenge { .. }
        ));
        assert!(rx.try_recv().is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_auto_link_connects_after_challenge() {
        let (transport, mut rx) = setup(true);
        transport.connect(None).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::CredentialChallenge { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::ConnectionStateChanged {
                state: TransportState::Connected { .. }
            }
        ));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_resume_with_credential_skips_challenge() {
        let (transport, mut rx) = setup(false);
        let cred = Credential("stored".into());
        transport.connect(Some(&cred)).await.unwrap();
        match rx.try_recv().unwrap() {
            TransportEvent::ConnectionStateChanged {
                state: TransportState::Connected { credential, .. },
            } => assert_eq!(credential, cred),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_connect_fails() {
        let (transport, _rx) = setup(false);
        transport.set_reachable(false);
        assert!(transport.connect(None).await.is_err());
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (transport, _rx) = setup(false);
        assert!(transport.send(&envelope()).await.is_err());
        transport.link().await.unwrap();
        transport.send(&envelope()).await.unwrap();
        assert_eq!(transport.sent(), vec![envelope()]);
    }

    #[tokio::test]
    async fn test_failing_sends_are_not_recorded() {
        let (transport, _rx) = setup(false);
        transport.link().await.unwrap();
        transport.set_fail_sends(true);
        assert!(transport.send(&envelope()).await.is_err());
        assert!(transport.sent().is_empty());
    }
}
