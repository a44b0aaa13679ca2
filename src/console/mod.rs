//! Console wiring: builds every component from config, hydrates them from
//! persistence and runs the transport event pump.
//!
//! Operations that span components (sending a reply through the transport,
//! deleting a label everywhere, removing an agent and their logins) live
//! here so the components themselves stay independent.

use crate::auth::{AuthService, Principal};
use crate::bus::{EventFeed, TransportBus, TransportEvent};
use crate::config::{
    Config, ConsoleSettings, SharedSettings, StorageBackend, TransportKind,
};
use crate::directory::Directory;
use crate::errors::{ZapdeskError, ZapdeskResult};
use crate::model::{
    AgentId, Capability, ContactId, Conversation, ConversationId, DeliveryStatus, Label, LabelId,
    Message, MessageId, SessionState,
};
use crate::persistence::{MemoryPersistence, Persistence, SqlitePersistence};
use crate::router::{AssignmentLedger, ConversationRouter};
use crate::session::{SessionManager, SessionOptions};
use crate::store::{ConversationTable, MessageStore};
use crate::transport::{
    BridgeTransport, LoopbackTransport, OutboundEnvelope, SharedBus, Transport,
};
use crate::utils::normalize_contact_id;
use crate::utils::task_tracker::TaskTracker;
use anyhow::{Context, Result};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PUMP_TASK: &str = "transport-pump";
const LOGIN_SWEEP_TASK: &str = "login-sweeper";
const LOGIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Console {
    config: Config,
    settings: SharedSettings,
    feed: Arc<EventFeed>,
    bus: SharedBus,
    persistence: Arc<dyn Persistence>,
    directory: Arc<Directory>,
    store: Arc<MessageStore>,
    router: Arc<ConversationRouter>,
    auth: Arc<AuthService>,
    session: Arc<SessionManager>,
    tasks: TaskTracker,
}

impl Console {
    /// Build the storage backend and transport named in `config`, then
    /// start the console on them.
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let persistence: Arc<dyn Persistence> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryPersistence::new()),
            StorageBackend::Sqlite => {
                let path = config.storage.database_path()?;
                Arc::new(SqlitePersistence::new(&path)?)
            }
        };

        let bus: SharedBus = Arc::new(tokio::sync::Mutex::new(TransportBus::new(
            config.bus.inbound_rate_limit,
            config.bus.rate_window_secs,
            config.bus.inbound_capacity,
        )));

        let transport: Arc<dyn Transport> = match config.transport.kind {
            TransportKind::Loopback => Arc::new(LoopbackTransport::new(
                bus.clone(),
                config.transport.loopback_phone.clone(),
                true,
            )),
            TransportKind::Bridge => {
                let token = Some(config.transport.bridge_token.clone()).filter(|t| !t.is_empty());
                Arc::new(BridgeTransport::new(config.transport.bridge_url.clone(), token))
            }
        };

        Self::start(config, persistence, transport, bus).await
    }

    /// Assemble the console on explicit parts, hydrate state, create the
    /// bootstrap administrator if needed, start the event pump and resume
    /// a stored WhatsApp session.
    pub async fn start(
        config: Config,
        persistence: Arc<dyn Persistence>,
        transport: Arc<dyn Transport>,
        bus: SharedBus,
    ) -> Result<Arc<Self>> {
        let rx = bus
            .lock()
            .await
            .take_rx()
            .context("transport bus receiver already taken")?;

        let settings: SharedSettings = Arc::new(RwLock::new(config.console_settings()));
        let feed = Arc::new(EventFeed::default());
        let ledger = Arc::new(AssignmentLedger::new());
        let directory = Arc::new(Directory::new(
            ledger.clone(),
            persistence.clone(),
            feed.clone(),
            settings.clone(),
        ));
        let table = Arc::new(ConversationTable::new());
        let store = Arc::new(MessageStore::new(table, persistence.clone(), feed.clone()));
        let router = Arc::new(ConversationRouter::new(
            store.clone(),
            ledger,
            directory.clone(),
            settings.clone(),
            persistence.clone(),
            feed.clone(),
        ));
        let auth = Arc::new(AuthService::new(directory.clone(), settings.clone()));
        let session = Arc::new(SessionManager::new(
            transport,
            persistence.clone(),
            feed.clone(),
            settings.clone(),
            SessionOptions::from_config(&config.session),
        ));

        let console = Arc::new(Self {
            config,
            settings,
            feed,
            bus,
            persistence,
            directory,
            store,
            router,
            auth,
            session,
            tasks: TaskTracker::new(),
        });

        console.hydrate().await?;
        if let Some(admin) = console
            .directory
            .bootstrap_admin(&console.config.auth.bootstrap_admin)?
        {
            info!("bootstrap administrator ready: email={}", admin.email);
        }

        console.spawn_pump(rx);
        console.spawn_login_sweeper();

        if console.session.has_stored_credential() {
            info!("resuming stored whatsapp session");
            if let Err(e) = console.session.connect().await {
                warn!("failed to resume whatsapp session: {}", e);
            }
        }
        Ok(console)
    }

    async fn hydrate(&self) -> Result<()> {
        let agents = self.persistence.load_agents()?;
        let labels = self.persistence.load_labels()?;
        let (agent_count, label_count) = (agents.len(), labels.len());
        self.directory.restore(agents, labels);

        let conversations = self.persistence.load_conversations()?;
        let conversation_count = conversations.len();
        for conversation in conversations {
            let log = self
                .persistence
                .load_messages(&conversation.id)
                .with_context(|| format!("Failed to load messages of {}", conversation.id))?;
            self.store.restore(conversation, log).await?;
        }
        let assigned = self.router.rebuild_ledger().await;

        if let Some(session) = self.persistence.load_session()? {
            self.session.restore(session);
        }

        info!(
            "console hydrated: agents={} labels={} conversations={} assigned={}",
            agent_count, label_count, conversation_count, assigned
        );
        Ok(())
    }

    fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<TransportEvent>) {
        let console: Weak<Self> = Arc::downgrade(self);
        self.tasks.spawn(PUMP_TASK, async move {
            while let Some(event) = rx.recv().await {
                let Some(console) = console.upgrade() else {
                    break;
                };
                console.dispatch(event).await;
            }
            debug!("transport event pump stopped");
        });
    }

    /// Periodically forget logins that went idle past the timeout.
    fn spawn_login_sweeper(self: &Arc<Self>) {
        let auth = Arc::downgrade(&self.auth);
        self.tasks.spawn(LOGIN_SWEEP_TASK, async move {
            let mut tick = tokio::time::interval(LOGIN_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(auth) = auth.upgrade() else {
                    break;
                };
                let offline = auth.prune_expired();
                if !offline.is_empty() {
                    debug!("login sweep took agents offline: count={}", offline.len());
                }
            }
        });
    }

    /// Apply one transport event.
    pub async fn dispatch(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::InboundMessage {
                contact_id,
                body,
                timestamp,
            } => {
                let contact = normalize_contact_id(&contact_id);
                if contact.is_empty() {
                    warn!("inbound message without a usable contact id dropped");
                    return;
                }
                match self
                    .router
                    .route_inbound(&ContactId::from(contact), body, timestamp)
                    .await
                {
                    Ok(routed) if routed.created => {
                        self.schedule_auto_response(&routed.conversation.id);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("failed to route inbound message: {}", e),
                }
            }
            TransportEvent::DeliveryReceipt { message_id, status } => {
                match self.store.update_status(&message_id, status).await {
                    Ok(_) => {}
                    Err(e @ ZapdeskError::InvalidTransition { .. }) => {
                        debug!("stale delivery receipt ignored: message={} {}", message_id, e);
                    }
                    Err(e) => warn!("failed to apply delivery receipt: message={} {}", message_id, e),
                }
            }
            other => self.session.handle_transport_event(&other),
        }
    }

    // ── auto response ──────────────────────────────────────

    fn schedule_auto_response(self: &Arc<Self>, conversation_id: &ConversationId) {
        let auto = self.settings().auto_response;
        if !auto.enabled {
            return;
        }
        let console = Arc::downgrade(self);
        let id = conversation_id.clone();
        self.tasks
            .spawn(format!("auto-response:{conversation_id}"), async move {
                tokio::time::sleep(Duration::from_secs(auto.delay_secs)).await;
                if let Some(console) = console.upgrade()
                    && let Err(e) = console.send_auto_response(&id).await
                {
                    warn!("automatic reply failed: conversation={} error={}", id, e);
                }
            });
        debug!(
            "automatic reply scheduled: conversation={} delay={}s",
            conversation_id, auto.delay_secs
        );
    }

    /// Send the configured greeting if the conversation is still waiting
    /// for its first reply. Settings are re-read, so disabling auto
    /// responses cancels greetings that have not gone out yet.
    async fn send_auto_response(&self, conversation_id: &ConversationId) -> ZapdeskResult<()> {
        let auto = self.settings().auto_response;
        if !auto.enabled {
            return Ok(());
        }
        if self.session.state() != SessionState::Connected {
            debug!(
                "automatic reply skipped, session not connected: conversation={}",
                conversation_id
            );
            return Ok(());
        }
        let Some((conversation, message)) = self
            .router
            .append_if_unanswered(conversation_id, &auto.message)
            .await?
        else {
            return Ok(());
        };
        info!("automatic reply sent: conversation={}", conversation_id);
        self.deliver(&conversation, &message).await
    }

    // ── messages ───────────────────────────────────────────

    /// Record an agent reply and hand it to the transport.
    ///
    /// The message is stored before it is sent. If the transport then
    /// fails, it stays in the log with status `sent` and the error is
    /// returned.
    pub async fn send_reply(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
        body: &str,
    ) -> ZapdeskResult<Message> {
        if self.session.state() != SessionState::Connected {
            return Err(ZapdeskError::InvalidState(
                "whatsapp session is not connected".into(),
            ));
        }
        let (conversation, message) = self
            .router
            .append_outbound(actor, conversation_id, body)
            .await?;
        self.deliver(&conversation, &message).await?;
        Ok(message)
    }

    async fn deliver(&self, conversation: &Conversation, message: &Message) -> ZapdeskResult<()> {
        let envelope = OutboundEnvelope {
            message_id: message.id.clone(),
            contact_id: conversation.contact_id.clone(),
            body: message.body.clone(),
        };
        self.session
            .transport()
            .send(&envelope)
            .await
            .with_context(|| format!("message {} stored but not delivered", message.id))?;
        debug!(
            "message handed to transport: message={} contact={}",
            message.id, conversation.contact_id
        );
        Ok(())
    }

    /// Manual delivery status update. Receipts from the transport go
    /// through the pump instead.
    pub async fn update_message_status(
        &self,
        actor: &Principal,
        message_id: &MessageId,
        status: DeliveryStatus,
    ) -> ZapdeskResult<Message> {
        actor.require(Capability::HandleConversations)?;
        let message = self.store.get_message(message_id).await?;
        self.router.get(actor, &message.conversation_id).await?;
        self.store.update_status(message_id, status).await
    }

    // ── administration ─────────────────────────────────────

    pub fn settings(&self) -> ConsoleSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the runtime settings. Takes effect immediately and is not
    /// written back to the config file.
    pub fn update_settings(
        &self,
        actor: &Principal,
        settings: ConsoleSettings,
    ) -> ZapdeskResult<ConsoleSettings> {
        actor.require(Capability::ManageSettings)?;
        settings.validate()?;
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings.clone();
        info!("console settings updated by {}", actor.agent_id);
        Ok(settings)
    }

    /// Delete a label and detach it from every conversation.
    pub async fn delete_label(&self, actor: &Principal, label_id: &LabelId) -> ZapdeskResult<Label> {
        let label = self.directory.delete_label(actor, label_id)?;
        self.router.purge_label(label_id).await?;
        Ok(label)
    }

    /// Delete an agent and end their login sessions.
    pub fn delete_agent(&self, actor: &Principal, agent_id: &AgentId) -> ZapdeskResult<()> {
        self.directory.delete_agent(actor, agent_id)?;
        let revoked = self.auth.revoke_agent(agent_id);
        if revoked > 0 {
            debug!("revoked {} login sessions of removed agent {}", revoked, agent_id);
        }
        Ok(())
    }

    // ── whatsapp session ───────────────────────────────────

    pub async fn connect_session(&self, actor: &Principal) -> ZapdeskResult<SessionState> {
        actor.require(Capability::ManageSession)?;
        self.session.connect().await
    }

    pub async fn disconnect_session(&self, actor: &Principal) -> ZapdeskResult<()> {
        actor.require(Capability::ManageSession)?;
        self.session.disconnect().await
    }

    pub async fn session_credential(
        &self,
        actor: &Principal,
    ) -> ZapdeskResult<crate::model::CredentialPayload> {
        actor.require(Capability::ManageSession)?;
        self.session.request_credential().await
    }

    /// Stop background work. Persisted state is left as it is.
    pub fn shutdown(&self) {
        self.session.shutdown();
        self.tasks.cancel_all();
        info!("console stopped");
    }

    // ── components ─────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn feed(&self) -> &Arc<EventFeed> {
        &self.feed
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<ConversationRouter> {
        &self.router
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }
}
