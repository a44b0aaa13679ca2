// Shared test helpers; not every test binary uses every item.
#![allow(unused)]

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use zapdesk::Console;
use zapdesk::auth::Principal;
use zapdesk::bus::{DomainEvent, FeedEvent, TransportBus};
use zapdesk::config::Config;
use zapdesk::model::{Agent, AgentId, Conversation, Presence, Role, SessionState};
use zapdesk::persistence::Persistence;
use zapdesk::router::ConversationFilter;
use zapdesk::transport::{LoopbackTransport, SharedBus};

pub struct TestConsole {
    pub console: Arc<Console>,
    pub transport: Arc<LoopbackTransport>,
}

/// Defaults with the clock-dependent gate turned off.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.working_hours.enabled = false;
    config.auto_response.enabled = false;
    config
}

pub async fn start_console(
    config: Config,
    persistence: Arc<dyn Persistence>,
    auto_link: bool,
) -> TestConsole {
    let bus: SharedBus = Arc::new(tokio::sync::Mutex::new(TransportBus::default()));
    let transport = Arc::new(LoopbackTransport::new(
        bus.clone(),
        "5511900000000",
        auto_link,
    ));
    let console = Console::start(config, persistence, transport.clone(), bus)
        .await
        .expect("console starts");
    TestConsole { console, transport }
}

pub async fn connect(t: &TestConsole) {
    t.console
        .connect_session(&Principal::system())
        .await
        .expect("connect");
    settle().await;
    assert_eq!(t.console.session().state(), SessionState::Connected);
}

/// Let the transport pump drain the bus.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// An online agent stored before the console starts. The empty hash means
/// the account cannot log in, which these tests never need.
pub fn seed_agent(persistence: &dyn Persistence, id: &str, capacity: u32) -> AgentId {
    let agent = Agent {
        id: AgentId::from(id),
        name: format!("Agent {id}"),
        email: format!("{id}@example.com"),
        role: Role::Agent,
        presence: Presence::Online,
        capacity,
        password_hash: String::new(),
        created_at: Utc::now(),
    };
    persistence.save_agent(&agent).expect("save agent");
    agent.id
}

pub fn agent_principal(id: &AgentId) -> Principal {
    Principal::new(id.clone(), Role::Agent)
}

pub async fn all_conversations(console: &Console) -> Vec<Conversation> {
    console
        .router()
        .list(&Principal::system(), &ConversationFilter::default())
        .await
}

pub async fn conversation_for(console: &Console, contact: &str) -> Conversation {
    all_conversations(console)
        .await
        .into_iter()
        .find(|c| c.contact_id.as_str() == contact)
        .unwrap_or_else(|| panic!("no conversation for {contact}"))
}

pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<FeedEvent>) -> Vec<DomainEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    events
}
