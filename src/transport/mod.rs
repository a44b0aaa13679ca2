//! Boundary to the messaging transport (the WhatsApp protocol client).
//!
//! The core only drives a transport through [`Transport`]; everything the
//! transport reports flows back as [`TransportEvent`]s through the shared
//! [`TransportBus`](crate::bus::TransportBus).

pub mod bridge;
pub mod loopback;

use crate::bus::TransportBus;
use crate::model::{ContactId, Credential, MessageId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use crate::bus::{TransportEvent, TransportState};
pub use bridge::BridgeTransport;
pub use loopback::LoopbackTransport;

/// Bus handle shared between transports, the webhook and the console.
pub type SharedBus = Arc<Mutex<TransportBus>>;

/// An outbound message handed to the transport. The message id is ours, so
/// delivery receipts can reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    pub message_id: MessageId,
    pub contact_id: ContactId,
    pub body: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Start (or resume, when `credential` is given) a connection. The
    /// outcome arrives asynchronously as transport events.
    async fn connect(&self, credential: Option<&Credential>) -> anyhow::Result<()>;

    /// Log out and drop the connection.
    async fn disconnect(&self) -> anyhow::Result<()>;

    async fn send(&self, envelope: &OutboundEnvelope) -> anyhow::Result<()>;
}
