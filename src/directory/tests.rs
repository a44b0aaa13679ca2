use super::*;
use crate::config::ConsoleSettings;
use crate::model::ConversationId;
use crate::persistence::MemoryPersistence;

struct Fixture {
    directory: Directory,
    ledger: Arc<AssignmentLedger>,
    persistence: Arc<MemoryPersistence>,
    feed: Arc<EventFeed>,
    settings: SharedSettings,
}

fn fixture() -> Fixture {
    let ledger = Arc::new(AssignmentLedger::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let feed = Arc::new(EventFeed::default());
    let settings: SharedSettings = Arc::new(RwLock::new(ConsoleSettings::default()));
    let directory = Directory::new(
        ledger.clone(),
        persistence.clone(),
        feed.clone(),
        settings.clone(),
    );
    Fixture {
        directory,
        ledger,
        persistence,
        feed,
        settings,
    }
}

fn new_agent(name: &str, email: &str) -> NewAgent {
    NewAgent {
        name: name.into(),
        email: email.into(),
        password: "senha123".into(),
        confirm_password: "senha123".into(),
        role: Role::Agent,
        capacity: None,
    }
}

fn admin() -> Principal {
    Principal::system()
}

#[test]
fn test_create_agent_uses_default_capacity_and_persists() {
    let fx = fixture();
    fx.settings
        .write()
        .unwrap()
        .routing
        .max_conversations_per_agent = 7;

    let profile = fx
        .directory
        .create_agent(&admin(), new_agent("Ana Souza", "Ana@Example.com"))
        .unwrap();
    assert_eq!(profile.capacity, 7);
    assert_eq!(profile.email, "ana@example.com");
    assert_eq!(profile.presence, Presence::Offline);

    let stored = fx.persistence.load_agents().unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].password_hash.starts_with("$argon2id$"));
}

#[test]
fn test_create_agent_validation() {
    let fx = fixture();
    let cases = [
        (new_agent("A", "a@example.com"), "name"),
        (new_agent("Ana", "not-an-email"), "email"),
        (new_agent("Ana", "ana@localhost"), "email"),
        (
            NewAgent {
                password: "12345".into(),
                confirm_password: "12345".into(),
                ..new_agent("Ana", "ana@example.com")
            },
            "password",
        ),
        (
            NewAgent {
                confirm_password: "different".into(),
                ..new_agent("Ana", "ana@example.com")
            },
            "match",
        ),
        (
            NewAgent {
                capacity: Some(0),
                ..new_agent("Ana", "ana@example.com")
            },
            "capacity",
        ),
    ];
    for (input, needle) in cases {
        let err = fx.directory.create_agent(&admin(), input).unwrap_err();
        assert!(
            matches!(err, ZapdeskError::Validation(ref msg) if msg.contains(needle)),
            "expected validation error mentioning {needle}, got {err}"
        );
    }
    assert!(fx.directory.is_empty());
}

#[test]
fn test_create_agent_rejects_duplicate_email() {
    let fx = fixture();
    fx.directory
        .create_agent(&admin(), new_agent("Ana", "ana@example.com"))
        .unwrap();
    let err = fx
        .directory
        .create_agent(&admin(), new_agent("Ana Two", " ANA@example.com "))
        .unwrap_err();
    assert!(matches!(err, ZapdeskError::Validation(_)));
    assert_eq!(fx.directory.agents().len(), 1);
}

#[test]
fn test_agents_cannot_manage_agents() {
    let fx = fixture();
    let caller = Principal::new(AgentId::from("a1"), Role::Agent);
    let err = fx
        .directory
        .create_agent(&caller, new_agent("Ana", "ana@example.com"))
        .unwrap_err();
    assert!(matches!(err, ZapdeskError::Forbidden(_)));
}

#[test]
fn test_update_agent_changes_fields_and_checks_email() {
    let fx = fixture();
    let ana = fx
        .directory
        .create_agent(&admin(), new_agent("Ana", "ana@example.com"))
        .unwrap();
    fx.directory
        .create_agent(&admin(), new_agent("Bruno", "bruno@example.com"))
        .unwrap();

    let updated = fx
        .directory
        .update_agent(
            &admin(),
            &ana.id,
            AgentUpdate {
                name: Some("Ana Lima".into()),
                capacity: Some(2),
                ..AgentUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(updated.name, "Ana Lima");
    assert_eq!(updated.capacity, 2);

    let err = fx
        .directory
        .update_agent(
            &admin(),
            &ana.id,
            AgentUpdate {
                email: Some("bruno@example.com".into()),
                ..AgentUpdate::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ZapdeskError::Validation(_)));
    assert_eq!(
        fx.directory.agent(&ana.id).unwrap().email,
        "ana@example.com"
    );
}

#[test]
fn test_set_presence_self_or_admin_only() {
    let fx = fixture();
    let ana = fx
        .directory
        .create_agent(&admin(), new_agent("Ana", "ana@example.com"))
        .unwrap();
    let bruno = fx
        .directory
        .create_agent(&admin(), new_agent("Bruno", "bruno@example.com"))
        .unwrap();

    let as_ana = Principal::new(ana.id.clone(), Role::Agent);
    let online = fx
        .directory
        .set_presence(&as_ana, &ana.id, Presence::Online)
        .unwrap();
    assert_eq!(online.presence, Presence::Online);

    let err = fx
        .directory
        .set_presence(&as_ana, &bruno.id, Presence::Online)
        .unwrap_err();
    assert!(matches!(err, ZapdeskError::Forbidden(_)));
}

#[tokio::test]
async fn test_going_offline_emits_notice_when_enabled() {
    let fx = fixture();
    let ana = fx
        .directory
        .create_agent(&admin(), new_agent("Ana", "ana@example.com"))
        .unwrap();
    fx.directory
        .set_presence(&admin(), &ana.id, Presence::Online)
        .unwrap();

    let mut rx = fx.feed.subscribe();
    fx.directory
        .set_presence(&admin(), &ana.id, Presence::Offline)
        .unwrap();
    let updated = rx.recv().await.unwrap();
    assert_eq!(updated.event.name(), "agent_updated");
    let notice = rx.recv().await.unwrap();
    assert!(matches!(
        notice.event,
        DomainEvent::Notice {
            kind: NoticeKind::AgentOffline,
            ..
        }
    ));

    // Disabled: only the profile update goes out.
    fx.settings.write().unwrap().notifications.agent_offline = false;
    fx.directory
        .set_presence(&admin(), &ana.id, Presence::Online)
        .unwrap();
    fx.directory
        .set_presence(&admin(), &ana.id, Presence::Offline)
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().event.name(), "agent_updated");
    assert_eq!(rx.recv().await.unwrap().event.name(), "agent_updated");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_delete_agent_refused_while_holding_conversations() {
    let fx = fixture();
    let ana = fx
        .directory
        .create_agent(&admin(), new_agent("Ana", "ana@example.com"))
        .unwrap();
    fx.ledger.lock().add(&ana.id, &ConversationId::from("c1"));

    let err = fx.directory.delete_agent(&admin(), &ana.id).unwrap_err();
    assert!(matches!(err, ZapdeskError::InvalidState(_)));
    assert!(fx.directory.agent(&ana.id).is_ok());

    fx.ledger.lock().remove(&ana.id, &ConversationId::from("c1"));
    fx.directory.delete_agent(&admin(), &ana.id).unwrap();
    assert!(matches!(
        fx.directory.agent(&ana.id),
        Err(ZapdeskError::NotFound { .. })
    ));
    assert!(fx.persistence.load_agents().unwrap().is_empty());
}

#[test]
fn test_failed_write_leaves_directory_unchanged() {
    let fx = fixture();
    let ana = fx
        .directory
        .create_agent(&admin(), new_agent("Ana", "ana@example.com"))
        .unwrap();
    fx.persistence.set_fail_writes(true);

    assert!(
        fx.directory
            .set_presence(&admin(), &ana.id, Presence::Online)
            .is_err()
    );
    assert_eq!(
        fx.directory.agent(&ana.id).unwrap().presence,
        Presence::Offline
    );
    assert!(
        fx.directory
            .create_agent(&admin(), new_agent("Bruno", "bruno@example.com"))
            .is_err()
    );
    assert_eq!(fx.directory.agents().len(), 1);
}

#[test]
fn test_bootstrap_admin_only_when_empty() {
    let fx = fixture();
    let config = BootstrapAdminConfig {
        name: String::new(),
        email: "admin@example.com".into(),
        password: "admin123".into(),
    };
    let created = fx.directory.bootstrap_admin(&config).unwrap().unwrap();
    assert_eq!(created.role, Role::Admin);
    assert_eq!(created.name, "Administrator");

    assert!(fx.directory.bootstrap_admin(&config).unwrap().is_none());
    assert_eq!(fx.directory.agents().len(), 1);
}

#[test]
fn test_labels_unique_and_sorted() {
    let fx = fixture();
    fx.directory
        .create_label(
            &admin(),
            NewLabel {
                name: "Vendas".into(),
                color: "#22c55e".into(),
                description: Some("  ".into()),
            },
        )
        .unwrap();
    let suporte = fx
        .directory
        .create_label(
            &admin(),
            NewLabel {
                name: "Suporte".into(),
                color: "blue".into(),
                description: Some("Dúvidas técnicas".into()),
            },
        )
        .unwrap();

    let err = fx
        .directory
        .create_label(
            &admin(),
            NewLabel {
                name: "suporte".into(),
                color: "red".into(),
                description: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, ZapdeskError::Validation(_)));

    let names: Vec<String> = fx.directory.labels().into_iter().map(|l| l.name).collect();
    assert_eq!(names, vec!["Suporte", "Vendas"]);
    assert!(fx.directory.labels()[1].description.is_none());

    fx.directory.delete_label(&admin(), &suporte.id).unwrap();
    assert!(!fx.directory.has_label(&suporte.id));
    assert_eq!(fx.persistence.load_labels().unwrap().len(), 1);
}
