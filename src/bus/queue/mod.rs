use crate::bus::TransportEvent;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_RATE_LIMIT: usize = 30;
const DEFAULT_RATE_WINDOW_S: f64 = 60.0;
const DEFAULT_CAPACITY: usize = 1000;
/// Timeout for channel send operations to prevent indefinite blocking
/// when the event pump is slow or stalled.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum inbound message body length (64 KB, WhatsApp caps text at 65536)
const MAX_INBOUND_BODY_LEN: usize = 65_536;
/// Maximum number of tracked contacts before forced pruning
const MAX_TRACKED_CONTACTS: usize = 5000;

/// Inbound message refused because its contact exceeded the rate limit.
#[derive(Debug, thiserror::Error)]
#[error("Rate limit exceeded for {contact_id}")]
pub struct RateLimited {
    pub contact_id: String,
}

/// Queue between transports (and the transport webhook) and the console's
/// event pump. Inbound messages are rate limited per contact; state
/// changes, challenges and receipts are never dropped.
pub struct TransportBus {
    pub tx: mpsc::Sender<TransportEvent>,
    rx: Option<mpsc::Receiver<TransportEvent>>,
    rate_limit: usize,
    rate_window: Duration,
    contact_timestamps: HashMap<String, Vec<Instant>>,
}

impl TransportBus {
    pub fn new(rate_limit: usize, rate_window_secs: f64, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Some(rx),
            rate_limit,
            rate_window: Duration::from_secs_f64(rate_window_secs),
            contact_timestamps: HashMap::new(),
        }
    }
}

impl Default for TransportBus {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_S, DEFAULT_CAPACITY)
    }
}

impl TransportBus {
    /// Extract the receiver to avoid holding the bus lock during await
    pub fn take_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.rx.take()
    }

    pub async fn publish(&mut self, mut event: TransportEvent) -> Result<()> {
        if let TransportEvent::InboundMessage { contact_id, body, .. } = &mut event {
            if body.len() > MAX_INBOUND_BODY_LEN {
                warn!(
                    "inbound message too large ({} bytes), truncating to {}",
                    body.len(),
                    MAX_INBOUND_BODY_LEN
                );
                let mut cut = MAX_INBOUND_BODY_LEN;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            self.check_rate(contact_id)?;
        }

        let kind = event.kind();
        tokio::time::timeout(SEND_TIMEOUT, self.tx.send(event))
            .await
            .map_err(|_| {
                warn!(
                    "transport event send timed out after {}s, queue full or event pump stalled",
                    SEND_TIMEOUT.as_secs()
                );
                anyhow::anyhow!("transport event send timed out, queue full")
            })?
            .context("Failed to send transport event - receiver closed")?;
        debug!("transport event queued: kind={}", kind);
        Ok(())
    }

    fn check_rate(&mut self, contact_id: &str) -> Result<()> {
        let now = Instant::now();
        let timestamps = self
            .contact_timestamps
            .entry(contact_id.to_string())
            .or_default();
        let cutoff = now.checked_sub(self.rate_window).unwrap_or(now);
        timestamps.retain(|&t| t > cutoff);

        if timestamps.len() >= self.rate_limit {
            warn!(
                "rate limit hit for contact {} ({}/{:.0}s), dropping message",
                contact_id,
                self.rate_limit,
                self.rate_window.as_secs_f64()
            );
            return Err(RateLimited {
                contact_id: contact_id.to_string(),
            }
            .into());
        }
        timestamps.push(now);

        // Prune inactive contacts to prevent unbounded growth
        if self.contact_timestamps.len() > MAX_TRACKED_CONTACTS {
            let rate_window = self.rate_window;
            self.contact_timestamps
                .retain(|_, ts| ts.iter().any(|&t| now.duration_since(t) < rate_window));
        }
        Ok(())
    }
}
