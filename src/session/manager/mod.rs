use crate::bus::{DomainEvent, EventFeed, NoticeKind, TransportEvent, TransportState};
use crate::config::{SessionConfig, SharedSettings};
use crate::errors::{ZapdeskError, ZapdeskResult};
use crate::model::{
    CredentialPayload, Session, SessionFailure, SessionSnapshot, SessionState,
};
use crate::persistence::Persistence;
use crate::transport::Transport;
use crate::utils::exponential_backoff_delay;
use anyhow::Context;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on the credential exchange (and on each reconnect attempt).
    pub credential_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            credential_timeout: Duration::from_secs(config.credential_timeout_secs),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_secs(config.reconnect_base_delay_secs),
            reconnect_max_delay: Duration::from_secs(config.reconnect_max_delay_secs),
        }
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    /// Bumped by every `connect`, `disconnect` and connection drop. Timers
    /// and reconnect loops carry the epoch they were started under and
    /// stand down once it moves on (last call wins).
    epoch: u64,
    challenge: Option<CredentialPayload>,
    /// A reconnect loop owns the current credential exchange.
    reconnecting: bool,
    timer: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Inner {
    fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Disconnected, |s| s.state)
    }

    fn last_error(&self) -> Option<&SessionFailure> {
        self.session.as_ref().and_then(|s| s.last_error.as_ref())
    }

    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
        self.reconnecting = false;
    }
}

/// Owns the lifecycle of the one messaging-transport connection.
///
/// State lives behind a std mutex that is never held across an await;
/// transport calls and backoff sleeps happen outside it. Every transition
/// is persisted (best effort: the live state follows the transport even
/// when the store is down) and published as `SessionStateChanged` while
/// the lock is held, so observers see transitions in commit order.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn Persistence>,
    feed: Arc<EventFeed>,
    settings: SharedSettings,
    options: SessionOptions,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    challenge_tx: watch::Sender<Option<CredentialPayload>>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
        feed: Arc<EventFeed>,
        settings: SharedSettings,
        options: SessionOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (challenge_tx, _) = watch::channel(None);
        Self {
            transport,
            persistence,
            feed,
            settings,
            options,
            inner: Mutex::new(Inner::default()),
            state_tx,
            challenge_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        self.lock().state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock()
            .session
            .as_ref()
            .map_or_else(SessionSnapshot::none, Session::snapshot)
    }

    pub fn has_stored_credential(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| s.credential.is_some())
    }

    /// Adopt a persisted session at start-up. The process just started, so
    /// whatever state was stored, the connection is down.
    pub fn restore(&self, mut session: Session) {
        session.state = SessionState::Disconnected;
        debug!(
            "session restored: session={} credential={}",
            session.id,
            session.credential.is_some()
        );
        self.lock().session = Some(session);
    }

    /// Record a transition: update, persist, notify.
    fn commit(&self, inner: &mut Inner, state: SessionState, failure: Option<SessionFailure>) {
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        let from = session.state;
        session.state = state;
        session.last_error.clone_from(&failure);
        session.updated_at = Utc::now();
        if let Err(e) = self.persistence.save_session(session) {
            warn!("failed to persist session state: {:#}", e);
        }
        self.state_tx.send_replace(state);
        info!(
            "session state changed: {} -> {} failure={:?}",
            from, state, failure
        );
        self.feed
            .publish(DomainEvent::SessionStateChanged { state, failure });
    }

    fn clear_challenge(&self, inner: &mut Inner) {
        inner.challenge = None;
        self.challenge_tx.send_replace(None);
    }

    fn fail_locked(&self, inner: &mut Inner, failure: SessionFailure) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        self.clear_challenge(inner);
        self.commit(inner, SessionState::Disconnected, Some(failure));
    }

    // ── operator actions ───────────────────────────────────

    /// Start a connection. From `Connected` this is a no-op; otherwise the
    /// session enters `AwaitingCredential` and a credential timer is armed.
    /// Calling again while waiting supersedes the earlier attempt.
    pub async fn connect(self: &Arc<Self>) -> ZapdeskResult<SessionState> {
        let (epoch, credential) = {
            let mut inner = self.lock();
            if inner.state() == SessionState::Connected {
                debug!("connect requested while already connected");
                return Ok(SessionState::Connected);
            }
            inner.epoch += 1;
            inner.cancel_tasks();
            self.clear_challenge(&mut inner);
            let epoch = inner.epoch;
            let credential = inner
                .session
                .get_or_insert_with(Session::new)
                .credential
                .clone();
            self.commit(&mut inner, SessionState::AwaitingCredential, None);

            let this = Arc::clone(self);
            let timeout = self.options.credential_timeout;
            inner.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                this.expire_credential(epoch);
            }));
            (epoch, credential)
        };

        info!(
            "session connecting: transport={} epoch={} resume={}",
            self.transport.name(),
            epoch,
            credential.is_some()
        );
        if let Err(e) = self.transport.connect(credential.as_ref()).await {
            let failure = SessionFailure::CredentialRejected {
                reason: format!("transport connect failed: {e:#}"),
            };
            warn!("session connect failed: epoch={} error={:#}", epoch, e);
            let mut inner = self.lock();
            if inner.epoch == epoch && inner.state() == SessionState::AwaitingCredential {
                self.fail_locked(&mut inner, failure.clone());
            }
            return Err(failure.into());
        }
        Ok(self.state())
    }

    fn expire_credential(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch != epoch || inner.state() != SessionState::AwaitingCredential {
            return;
        }
        // Detach rather than abort: this runs on the timer task itself.
        inner.timer = None;
        warn!(
            "credential exchange timed out after {}s",
            self.options.credential_timeout.as_secs()
        );
        self.fail_locked(&mut inner, SessionFailure::CredentialTimeout);
    }

    /// The current credential challenge. While the exchange is running and
    /// no challenge has arrived yet, waits for one up to the credential
    /// timeout.
    pub async fn request_credential(&self) -> ZapdeskResult<CredentialPayload> {
        let mut challenge_rx = self.challenge_tx.subscribe();
        let mut state_rx = self.state_tx.subscribe();
        {
            let inner = self.lock();
            let state = inner.state();
            if state != SessionState::AwaitingCredential {
                return Err(ZapdeskError::InvalidState(format!(
                    "no credential exchange in progress (session is {state})"
                )));
            }
            if let Some(payload) = &inner.challenge {
                return Ok(payload.clone());
            }
        }

        let wait = async {
            loop {
                tokio::select! {
                    changed = challenge_rx.changed() => {
                        if changed.is_err() {
                            return Err(ZapdeskError::InvalidState("session manager stopped".into()));
                        }
                        if let Some(payload) = challenge_rx.borrow_and_update().clone() {
                            return Ok(payload);
                        }
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return Err(ZapdeskError::InvalidState("session manager stopped".into()));
                        }
                        let state = *state_rx.borrow_and_update();
                        if state != SessionState::AwaitingCredential {
                            return Err(self.exchange_outcome_error(state));
                        }
                    }
                }
            }
        };
        tokio::time::timeout(self.options.credential_timeout, wait)
            .await
            .map_err(|_| ZapdeskError::CredentialTimeout)?
    }

    fn exchange_outcome_error(&self, state: SessionState) -> ZapdeskError {
        match self.lock().last_error().cloned() {
            Some(failure) if state == SessionState::Disconnected => failure.into(),
            _ => ZapdeskError::InvalidState(format!(
                "credential exchange ended without a challenge (session is {state})"
            )),
        }
    }

    /// Explicit logout: cancel timers and reconnects, destroy the session
    /// record and tear the transport down.
    pub async fn disconnect(&self) -> ZapdeskResult<()> {
        {
            let mut inner = self.lock();
            let Some(session_id) = inner.session.as_ref().map(|s| s.id.clone()) else {
                debug!("disconnect requested without a session");
                inner.epoch += 1;
                inner.cancel_tasks();
                return Ok(());
            };
            self.persistence
                .delete_session()
                .context("Failed to delete session")?;

            inner.epoch += 1;
            inner.cancel_tasks();
            self.clear_challenge(&mut inner);
            inner.session = None;
            self.state_tx.send_replace(SessionState::Disconnected);
            info!("session logged out: session={}", session_id);
            self.feed.publish(DomainEvent::SessionStateChanged {
                state: SessionState::Disconnected,
                failure: None,
            });
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("transport disconnect failed: {:#}", e);
        }
        Ok(())
    }

    /// Stop timers and reconnect loops without touching the session.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.cancel_tasks();
    }

    // ── transport events ───────────────────────────────────

    /// Apply a session-related transport event. Message traffic is
    /// ignored here.
    pub fn handle_transport_event(self: &Arc<Self>, event: &TransportEvent) {
        match event {
            TransportEvent::CredentialChallenge { payload } => self.on_challenge(payload),
            TransportEvent::ConnectionStateChanged { state } => self.on_connection_state(state),
            TransportEvent::InboundMessage { .. } | TransportEvent::DeliveryReceipt { .. } => {}
        }
    }

    pub fn on_challenge(&self, code: &str) {
        let mut inner = self.lock();
        if inner.state() != SessionState::AwaitingCredential {
            debug!(
                "ignoring credential challenge in state {}",
                inner.state()
            );
            return;
        }
        let payload = CredentialPayload::new(code);
        inner.challenge = Some(payload.clone());
        self.challenge_tx.send_replace(Some(payload.clone()));
        info!("credential challenge issued");
        self.feed.publish(DomainEvent::CredentialIssued { payload });
    }

    pub fn on_connection_state(self: &Arc<Self>, reported: &TransportState) {
        let mut inner = self.lock();
        let current = inner.state();
        match reported {
            TransportState::Connected { phone, credential } => {
                if current != SessionState::AwaitingCredential {
                    debug!("ignoring connected report in state {}", current);
                    return;
                }
                if let Some(timer) = inner.timer.take() {
                    timer.abort();
                }
                inner.reconnecting = false;
                self.clear_challenge(&mut inner);
                if let Some(session) = inner.session.as_mut() {
                    session.credential = Some(credential.clone());
                    session.phone = Some(phone.clone());
                }
                self.commit(&mut inner, SessionState::Connected, None);
            }
            TransportState::Rejected { reason } => {
                if current != SessionState::AwaitingCredential {
                    debug!("ignoring rejection in state {}", current);
                    return;
                }
                warn!("credential rejected by transport: {}", reason);
                // A rejected stored credential is stale; the next connect
                // starts a fresh exchange.
                if let Some(session) = inner.session.as_mut() {
                    session.credential = None;
                }
                self.fail_locked(
                    &mut inner,
                    SessionFailure::CredentialRejected {
                        reason: reason.clone(),
                    },
                );
            }
            TransportState::Closed { reason } => match current {
                SessionState::Connected => {
                    warn!("transport connection dropped: {}", reason);
                    inner.epoch += 1;
                    inner.reconnecting = true;
                    self.commit(&mut inner, SessionState::Disconnected, None);
                    let epoch = inner.epoch;
                    let this = Arc::clone(self);
                    inner.reconnect = Some(tokio::spawn(async move {
                        this.reconnect_loop(epoch).await;
                    }));
                }
                SessionState::AwaitingCredential if inner.reconnecting => {
                    debug!("reconnect attempt closed: {}", reason);
                    self.commit(&mut inner, SessionState::Disconnected, None);
                }
                SessionState::AwaitingCredential => {
                    self.fail_locked(
                        &mut inner,
                        SessionFailure::CredentialRejected {
                            reason: format!("transport closed during credential exchange: {reason}"),
                        },
                    );
                }
                SessionState::Disconnected => {
                    debug!("ignoring close report while disconnected");
                }
            },
        }
    }

    // ── reconnect ──────────────────────────────────────────

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        let max = self.options.max_reconnect_attempts;
        for attempt in 1..=max {
            let delay = exponential_backoff_delay(
                attempt - 1,
                self.options.reconnect_base_delay,
                self.options.reconnect_max_delay,
            );
            info!(
                "reconnect scheduled: attempt={}/{} delay_ms={}",
                attempt,
                max,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;

            let mut state_rx = self.state_tx.subscribe();
            let credential = {
                let mut inner = self.lock();
                if inner.epoch != epoch {
                    return;
                }
                let credential = inner.session.as_ref().and_then(|s| s.credential.clone());
                self.commit(&mut inner, SessionState::AwaitingCredential, None);
                credential
            };

            match self.transport.connect(credential.as_ref()).await {
                Ok(()) => {
                    let _ = tokio::time::timeout(
                        self.options.credential_timeout,
                        state_rx.wait_for(|s| *s != SessionState::AwaitingCredential),
                    )
                    .await;
                }
                Err(e) => {
                    warn!("reconnect attempt failed: attempt={} error={:#}", attempt, e);
                }
            }

            let finished = {
                let mut inner = self.lock();
                if inner.epoch != epoch {
                    return;
                }
                match inner.state() {
                    SessionState::Connected => {
                        info!("session reconnected: attempt={}", attempt);
                        true
                    }
                    SessionState::Disconnected
                        if matches!(
                            inner.last_error(),
                            Some(SessionFailure::CredentialRejected { .. })
                        ) =>
                    {
                        warn!("reconnect stopped: stored credential rejected");
                        inner.reconnecting = false;
                        true
                    }
                    SessionState::AwaitingCredential => {
                        debug!("reconnect attempt timed out: attempt={}", attempt);
                        self.commit(&mut inner, SessionState::Disconnected, None);
                        false
                    }
                    SessionState::Disconnected => false,
                }
            };
            if finished {
                return;
            }
        }
        self.give_up(epoch, max);
    }

    fn give_up(&self, epoch: u64, attempts: u32) {
        let notify = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .notifications
            .system_alerts;
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.reconnecting = false;
        // Detach: this runs on the reconnect task itself.
        inner.reconnect = None;
        error!(
            "connection lost after {} reconnect attempts, operator action required",
            attempts
        );
        self.commit(
            &mut inner,
            SessionState::Disconnected,
            Some(SessionFailure::ConnectionLost { attempts }),
        );
        if notify {
            self.feed.publish(DomainEvent::Notice {
                kind: NoticeKind::SystemAlert,
                message: format!(
                    "WhatsApp connection lost after {attempts} reconnect attempts; reconnect manually"
                ),
                contact_id: None,
            });
        }
    }

    // ── presentation ───────────────────────────────────────

    /// Terminal rendering of the pending challenge.
    pub fn render_qr(&self) -> ZapdeskResult<String> {
        let challenge = self.lock().challenge.clone();
        let Some(payload) = challenge else {
            return Err(ZapdeskError::InvalidState(
                "no credential challenge pending".into(),
            ));
        };
        let qr = qrcode::QrCode::new(payload.code.as_bytes())
            .map_err(|e| anyhow::anyhow!("failed to encode QR code: {e}"))?;
        Ok(qr
            .render::<char>()
            .quiet_zone(false)
            .module_dimensions(2, 1)
            .build())
    }
}
