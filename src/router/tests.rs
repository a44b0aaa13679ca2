use super::*;
use crate::bus::FeedEvent;
use crate::config::ConsoleSettings;
use crate::directory::NewLabel;
use crate::model::{Agent, Role};
use crate::persistence::MemoryPersistence;
use chrono::TimeZone;
use proptest::prelude::*;
use std::sync::RwLock;
use tokio::sync::broadcast;

struct Fixture {
    router: Arc<ConversationRouter>,
    directory: Arc<Directory>,
    store: Arc<MessageStore>,
    persistence: Arc<MemoryPersistence>,
    feed: Arc<EventFeed>,
    settings: SharedSettings,
}

fn fixture() -> Fixture {
    let persistence = Arc::new(MemoryPersistence::new());
    let feed = Arc::new(EventFeed::default());
    let mut console = ConsoleSettings::default();
    // Tests run at arbitrary wall-clock times.
    console.working_hours.enabled = false;
    let settings: SharedSettings = Arc::new(RwLock::new(console));
    let ledger = Arc::new(AssignmentLedger::new());
    let directory = Arc::new(Directory::new(
        ledger.clone(),
        persistence.clone(),
        feed.clone(),
        settings.clone(),
    ));
    let store = Arc::new(MessageStore::new(
        Arc::new(ConversationTable::new()),
        persistence.clone(),
        feed.clone(),
    ));
    let router = Arc::new(ConversationRouter::new(
        store.clone(),
        ledger,
        directory.clone(),
        settings.clone(),
        persistence.clone(),
        feed.clone(),
    ));
    Fixture {
        router,
        directory,
        store,
        persistence,
        feed,
        settings,
    }
}

/// Seed an agent without paying for password hashing.
fn seed_agent(f: &Fixture, id: &str, presence: Presence, capacity: u32) -> AgentId {
    seed_account(f, id, Role::Agent, presence, capacity)
}

fn seed_account(f: &Fixture, id: &str, role: Role, presence: Presence, capacity: u32) -> AgentId {
    f.directory.restore(
        vec![Agent {
            id: AgentId::from(id),
            name: format!("Agent {id}"),
            email: format!("{id}@example.com"),
            role,
            presence,
            capacity,
            password_hash: String::new(),
            created_at: Utc::now(),
        }],
        vec![],
    );
    AgentId::from(id)
}

fn system() -> Principal {
    Principal::system()
}

fn as_agent(id: &AgentId) -> Principal {
    Principal::new(id.clone(), Role::Agent)
}

fn disable_auto_assignment(f: &Fixture) {
    f.settings.write().unwrap().routing.auto_assignment = false;
}

async fn inbound(f: &Fixture, contact: &str, body: &str) -> RoutedInbound {
    f.router
        .route_inbound(&ContactId::from(contact), body, None)
        .await
        .unwrap()
}

fn drain(rx: &mut broadcast::Receiver<FeedEvent>) -> Vec<DomainEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e.event);
    }
    out
}

// ── inbound routing ─────────────────────────────────────

#[tokio::test]
async fn test_first_message_creates_pending_unassigned_conversation() {
    let f = fixture();
    let routed = inbound(&f, "C1", "Olá, preciso de ajuda").await;

    assert!(routed.created);
    let c = routed.conversation;
    assert_eq!(c.contact_id, ContactId::from("C1"));
    assert_eq!(c.status, ConversationStatus::Pending);
    assert!(c.assigned_agent.is_none());
    assert_eq!(c.unread_count, 1);
    assert_eq!(c.last_message_preview, "Olá, preciso de ajuda");
    assert_eq!(f.persistence.load_conversations().unwrap().len(), 1);
}

#[tokio::test]
async fn test_follow_up_message_joins_existing_conversation() {
    let f = fixture();
    let first = inbound(&f, "C1", "oi").await;
    let second = inbound(&f, "C1", "alguém aí?").await;

    assert!(!second.created);
    assert_eq!(first.conversation.id, second.conversation.id);
    assert_eq!(second.conversation.unread_count, 2);
    assert_eq!(second.message.seq, 1);

    let other = inbound(&f, "C2", "oi").await;
    assert_ne!(other.conversation.id, first.conversation.id);
}

#[tokio::test]
async fn test_created_event_precedes_message_event() {
    let f = fixture();
    let mut rx = f.feed.subscribe();
    inbound(&f, "C1", "oi").await;

    let names: Vec<&str> = drain(&mut rx).iter().map(DomainEvent::name).collect();
    assert_eq!(
        names,
        vec!["conversation_created", "message_appended", "notice"]
    );
}

#[tokio::test]
async fn test_new_message_notice_follows_settings() {
    let f = fixture();
    f.settings.write().unwrap().notifications.new_message = false;
    let mut rx = f.feed.subscribe();
    inbound(&f, "C1", "oi").await;
    assert!(
        drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, DomainEvent::Notice { .. }))
    );
}

#[tokio::test]
async fn test_auto_assign_prefers_fewest_open_then_lowest_id() {
    let f = fixture();
    let a2 = seed_agent(&f, "a2", Presence::Online, 5);
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);

    // Tie at zero: lowest id wins.
    let first = inbound(&f, "C1", "oi").await.conversation;
    assert_eq!(first.assigned_agent.as_ref(), Some(&a1));
    assert_eq!(first.status, ConversationStatus::Open);

    // a1 now holds one, a2 none.
    let second = inbound(&f, "C2", "oi").await.conversation;
    assert_eq!(second.assigned_agent.as_ref(), Some(&a2));

    let third = inbound(&f, "C3", "oi").await.conversation;
    assert_eq!(third.assigned_agent.as_ref(), Some(&a1));
    assert_eq!(f.router.open_count(&a1), 2);
    assert_eq!(f.router.open_count(&a2), 1);
}

#[tokio::test]
async fn test_auto_assign_skips_unavailable_full_and_admin_accounts() {
    let f = fixture();
    seed_agent(&f, "a1", Presence::Offline, 5);
    seed_agent(&f, "a2", Presence::Away, 5);
    seed_account(&f, "a3", Role::Admin, Presence::Online, 5);
    let a4 = seed_agent(&f, "a4", Presence::Online, 1);

    let first = inbound(&f, "C1", "oi").await.conversation;
    assert_eq!(first.assigned_agent.as_ref(), Some(&a4));

    // a4 is full now; nobody else qualifies.
    let second = inbound(&f, "C2", "oi").await.conversation;
    assert!(second.assigned_agent.is_none());
    assert_eq!(second.status, ConversationStatus::Pending);
}

#[tokio::test]
async fn test_auto_assign_disabled_leaves_queue() {
    let f = fixture();
    seed_agent(&f, "a1", Presence::Online, 5);
    disable_auto_assignment(&f);
    let c = inbound(&f, "C1", "oi").await.conversation;
    assert!(c.assigned_agent.is_none());
}

#[tokio::test]
async fn test_working_hours_gate_auto_assignment() {
    let f = fixture();
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    {
        let mut s = f.settings.write().unwrap();
        s.working_hours.enabled = true;
        s.working_hours.start = "08:00".into();
        s.working_hours.end = "18:00".into();
        s.working_hours.utc_offset_minutes = 0;
    }
    let night = Utc.with_ymd_and_hms(2026, 3, 2, 22, 30, 0).unwrap();
    let noon = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();

    let queued = f
        .router
        .route_inbound_at(&ContactId::from("C1"), "oi", None, night)
        .await
        .unwrap();
    assert!(queued.conversation.assigned_agent.is_none());

    let assigned = f
        .router
        .route_inbound_at(&ContactId::from("C2"), "oi", None, noon)
        .await
        .unwrap();
    assert_eq!(assigned.conversation.assigned_agent, Some(a1));
}

// ── assignment ─────────────────────────────────────────

#[tokio::test]
async fn test_assign_sets_agent_and_opens() {
    let f = fixture();
    disable_auto_assignment(&f);
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    let c = inbound(&f, "C1", "oi").await.conversation;

    let mut rx = f.feed.subscribe();
    let assigned = f.router.assign(&system(), &c.id, &a1).await.unwrap();
    assert_eq!(assigned.assigned_agent.as_ref(), Some(&a1));
    assert_eq!(assigned.status, ConversationStatus::Open);
    assert_eq!(f.router.open_count(&a1), 1);

    let events = drain(&mut rx);
    assert!(matches!(
        &events[0],
        DomainEvent::ConversationAssigned { agent_id, previous: None, .. } if agent_id == &a1
    ));
    assert!(matches!(
        &events[1],
        DomainEvent::ConversationStatusChanged {
            from: ConversationStatus::Pending,
            to: ConversationStatus::Open,
            ..
        }
    ));
}

#[tokio::test]
async fn test_assign_to_full_agent_fails_and_leaves_conversation_unassigned() {
    let f = fixture();
    disable_auto_assignment(&f);
    let a1 = seed_agent(&f, "A1", Presence::Online, 5);
    for i in 0..5 {
        let c = inbound(&f, &format!("C{i}"), "oi").await.conversation;
        f.router.assign(&system(), &c.id, &a1).await.unwrap();
    }
    assert_eq!(f.router.open_count(&a1), 5);

    let sixth = inbound(&f, "C6", "oi").await.conversation;
    let mut rx = f.feed.subscribe();
    let err = f.router.assign(&system(), &sixth.id, &a1).await.unwrap_err();
    assert!(matches!(
        err,
        ZapdeskError::CapacityExceeded { ref agent_id, capacity: 5 } if agent_id == "A1"
    ));

    let after = f.router.get(&system(), &sixth.id).await.unwrap();
    assert!(after.assigned_agent.is_none());
    assert_eq!(after.status, ConversationStatus::Pending);
    assert_eq!(f.router.open_count(&a1), 5);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_assign_to_offline_agent_fails() {
    let f = fixture();
    disable_auto_assignment(&f);
    let a1 = seed_agent(&f, "a1", Presence::Offline, 5);
    let c = inbound(&f, "C1", "oi").await.conversation;

    let err = f.router.assign(&system(), &c.id, &a1).await.unwrap_err();
    assert!(matches!(err, ZapdeskError::AgentUnavailable { .. }));
    assert!(f.router.get(&system(), &c.id).await.unwrap().assigned_agent.is_none());

    // Away still accepts manual assignment.
    f.directory
        .set_presence(&system(), &a1, Presence::Away)
        .unwrap();
    f.router.assign(&system(), &c.id, &a1).await.unwrap();
}

#[tokio::test]
async fn test_assign_unknown_agent_or_conversation() {
    let f = fixture();
    disable_auto_assignment(&f);
    let c = inbound(&f, "C1", "oi").await.conversation;
    assert!(matches!(
        f.router.assign(&system(), &c.id, &AgentId::from("ghost")).await,
        Err(ZapdeskError::NotFound { kind: "agent", .. })
    ));
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    assert!(matches!(
        f.router
            .assign(&system(), &ConversationId::from("nope"), &a1)
            .await,
        Err(ZapdeskError::NotFound {
            kind: "conversation",
            ..
        })
    ));
}

#[tokio::test]
async fn test_assign_same_agent_is_noop() {
    let f = fixture();
    let a1 = seed_agent(&f, "a1", Presence::Online, 1);
    let c = inbound(&f, "C1", "oi").await.conversation;
    assert_eq!(c.assigned_agent.as_ref(), Some(&a1));

    let mut rx = f.feed.subscribe();
    // At capacity, but already the assignee.
    let again = f.router.assign(&system(), &c.id, &a1).await.unwrap();
    assert_eq!(again.assigned_agent, Some(a1.clone()));
    assert_eq!(f.router.open_count(&a1), 1);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_failed_persist_leaves_assignment_unchanged() {
    let f = fixture();
    disable_auto_assignment(&f);
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    let c = inbound(&f, "C1", "oi").await.conversation;

    f.persistence.set_fail_writes(true);
    assert!(matches!(
        f.router.assign(&system(), &c.id, &a1).await,
        Err(ZapdeskError::Internal(_))
    ));
    f.persistence.set_fail_writes(false);

    assert!(f.router.get(&system(), &c.id).await.unwrap().assigned_agent.is_none());
    assert_eq!(f.router.open_count(&a1), 0);
}

#[tokio::test]
async fn test_reassign_moves_capacity() {
    let f = fixture();
    disable_auto_assignment(&f);
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    let a2 = seed_agent(&f, "a2", Presence::Online, 5);
    let c = inbound(&f, "C1", "oi").await.conversation;

    assert!(matches!(
        f.router.reassign(&system(), &c.id, &a2).await,
        Err(ZapdeskError::InvalidState(_))
    ));

    f.router.assign(&system(), &c.id, &a1).await.unwrap();
    let mut rx = f.feed.subscribe();
    let moved = f.router.reassign(&system(), &c.id, &a2).await.unwrap();
    assert_eq!(moved.assigned_agent.as_ref(), Some(&a2));
    assert_eq!(f.router.open_count(&a1), 0);
    assert_eq!(f.router.open_count(&a2), 1);

    // Already open: only the assignment event.
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        DomainEvent::ConversationAssigned { previous: Some(p), .. } if p == &a1
    ));
}

#[tokio::test]
async fn test_unassign_returns_to_queue() {
    let f = fixture();
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    let c = inbound(&f, "C1", "oi").await.conversation;
    assert!(c.assigned_agent.is_some());

    let queued = f.router.unassign(&as_agent(&a1), &c.id).await.unwrap();
    assert!(queued.assigned_agent.is_none());
    assert_eq!(queued.status, ConversationStatus::Pending);
    assert_eq!(f.router.open_count(&a1), 0);

    assert!(matches!(
        f.router.unassign(&system(), &c.id).await,
        Err(ZapdeskError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_agent_permissions_and_visibility() {
    let f = fixture();
    disable_auto_assignment(&f);
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    let a2 = seed_agent(&f, "a2", Presence::Online, 5);
    let c1 = inbound(&f, "C1", "oi").await.conversation;
    let c2 = inbound(&f, "C2", "oi").await.conversation;

    // Agents cannot hand work to someone else.
    assert!(matches!(
        f.router.assign(&as_agent(&a1), &c1.id, &a2).await,
        Err(ZapdeskError::Forbidden(_))
    ));
    // Claiming from the queue is fine.
    f.router.assign(&as_agent(&a1), &c1.id, &a1).await.unwrap();
    f.router.assign(&system(), &c2.id, &a2).await.unwrap();

    // a1 sees only their own conversation (the queue is empty now).
    let visible = f
        .router
        .list(&as_agent(&a1), &ConversationFilter::default())
        .await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, c1.id);

    assert!(matches!(
        f.router.get(&as_agent(&a1), &c2.id).await,
        Err(ZapdeskError::Forbidden(_))
    ));
    assert!(matches!(
        f.router.close(&as_agent(&a1), &c2.id).await,
        Err(ZapdeskError::Forbidden(_))
    ));
    assert!(matches!(
        f.router.messages(&as_agent(&a1), &c2.id).await,
        Err(ZapdeskError::Forbidden(_))
    ));

    // Admins see everything.
    assert_eq!(
        f.router
            .list(&system(), &ConversationFilter::default())
            .await
            .len(),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assignments_never_exceed_capacity() {
    let f = fixture();
    disable_auto_assignment(&f);
    let a1 = seed_agent(&f, "a1", Presence::Online, 3);
    let mut ids = Vec::new();
    for i in 0..12 {
        ids.push(inbound(&f, &format!("C{i}"), "oi").await.conversation.id);
    }

    let mut tasks = Vec::new();
    for id in ids.clone() {
        let router = f.router.clone();
        let agent = a1.clone();
        tasks.push(tokio::spawn(async move {
            router.assign(&Principal::system(), &id, &agent).await
        }));
    }
    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(ZapdeskError::CapacityExceeded { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(f.router.open_count(&a1), 3);

    let held = f
        .router
        .list(
            &system(),
            &ConversationFilter {
                assigned: AssignedFilter::Agent(a1.clone()),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(held.len(), 3);
}

// ── lifecycle ──────────────────────────────────────────

#[tokio::test]
async fn test_close_frees_capacity_and_next_inbound_opens_new_conversation() {
    let f = fixture();
    let a1 = seed_agent(&f, "a1", Presence::Online, 1);
    let first = inbound(&f, "C1", "oi").await.conversation;
    assert_eq!(f.router.open_count(&a1), 1);

    let closed = f.router.close(&system(), &first.id).await.unwrap();
    assert_eq!(closed.status, ConversationStatus::Closed);
    assert_eq!(closed.assigned_agent.as_ref(), Some(&a1));
    assert_eq!(f.router.open_count(&a1), 0);

    // History survives.
    assert_eq!(f.store.list_messages(&first.id).await.unwrap().len(), 1);
    assert!(matches!(
        f.store
            .append(&first.id, NewMessage::outbound(None, "tarde demais"))
            .await,
        Err(ZapdeskError::InvalidState(_))
    ));

    let next = inbound(&f, "C1", "voltei").await;
    assert!(next.created);
    assert_ne!(next.conversation.id, first.id);
    assert_eq!(next.conversation.assigned_agent, Some(a1));

    assert!(matches!(
        f.router.close(&system(), &first.id).await,
        Err(ZapdeskError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_reopen_requires_closed_and_no_active_conversation() {
    let f = fixture();
    disable_auto_assignment(&f);
    let first = inbound(&f, "C1", "oi").await.conversation;

    assert!(matches!(
        f.router.reopen(&system(), &first.id).await,
        Err(ZapdeskError::InvalidState(_))
    ));

    f.router.close(&system(), &first.id).await.unwrap();
    let second = inbound(&f, "C1", "de novo").await.conversation;
    assert!(matches!(
        f.router.reopen(&system(), &first.id).await,
        Err(ZapdeskError::InvalidState(ref msg)) if msg.contains("active conversation")
    ));

    f.router.close(&system(), &second.id).await.unwrap();
    let reopened = f.router.reopen(&system(), &first.id).await.unwrap();
    assert_eq!(reopened.status, ConversationStatus::Pending);
    assert!(reopened.assigned_agent.is_none());

    // The contact's messages land in the reopened conversation again.
    let routed = inbound(&f, "C1", "obrigado").await;
    assert!(!routed.created);
    assert_eq!(routed.conversation.id, first.id);
}

#[tokio::test]
async fn test_reopen_applies_auto_assignment() {
    let f = fixture();
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    let a2 = seed_agent(&f, "a2", Presence::Online, 5);
    let c = inbound(&f, "C1", "oi").await.conversation;
    assert_eq!(c.assigned_agent.as_ref(), Some(&a1));
    f.router.close(&system(), &c.id).await.unwrap();

    // Give a1 more load so the reopened conversation goes to a2.
    inbound(&f, "C2", "oi").await;
    inbound(&f, "C3", "oi").await;
    let counts = (f.router.open_count(&a1), f.router.open_count(&a2));
    assert_eq!(counts, (1, 1));
    f.directory
        .set_presence(&system(), &a1, Presence::Offline)
        .unwrap();

    let reopened = f.router.reopen(&system(), &c.id).await.unwrap();
    assert_eq!(reopened.assigned_agent, Some(a2));
    assert_eq!(reopened.status, ConversationStatus::Open);
}

// ── labels ─────────────────────────────────────────────

#[tokio::test]
async fn test_labels_attach_detach_and_purge() {
    let f = fixture();
    let vip = f
        .directory
        .create_label(
            &system(),
            NewLabel {
                name: "VIP".into(),
                color: "gold".into(),
                description: None,
            },
        )
        .unwrap();
    let c1 = inbound(&f, "C1", "oi").await.conversation;
    let c2 = inbound(&f, "C2", "oi").await.conversation;

    assert!(matches!(
        f.router
            .add_label(&system(), &c1.id, &LabelId::from("missing"))
            .await,
        Err(ZapdeskError::NotFound { kind: "label", .. })
    ));

    let labelled = f.router.add_label(&system(), &c1.id, &vip.id).await.unwrap();
    assert_eq!(labelled.labels, vec![vip.id.clone()]);
    // Adding twice keeps the set duplicate-free.
    let again = f.router.add_label(&system(), &c1.id, &vip.id).await.unwrap();
    assert_eq!(again.labels.len(), 1);
    f.router.add_label(&system(), &c2.id, &vip.id).await.unwrap();

    let by_label = ConversationFilter {
        label: Some(vip.id.clone()),
        ..Default::default()
    };
    assert_eq!(f.router.list(&system(), &by_label).await.len(), 2);

    let removed = f
        .router
        .remove_label(&system(), &c2.id, &vip.id)
        .await
        .unwrap();
    assert!(removed.labels.is_empty());

    f.directory.delete_label(&system(), &vip.id).unwrap();
    assert_eq!(f.router.purge_label(&vip.id).await.unwrap(), 1);
    assert!(f.router.list(&system(), &by_label).await.is_empty());
}

// ── queries and messages ───────────────────────────────

#[tokio::test]
async fn test_list_sorted_by_recent_activity_and_searchable() {
    let f = fixture();
    disable_auto_assignment(&f);
    let c1 = inbound(&f, "5511911110000", "pedido atrasado").await.conversation;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let c2 = inbound(&f, "5521922220000", "quero trocar o produto").await.conversation;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    inbound(&f, "5511911110000", "ainda aguardando").await;

    let all = f
        .router
        .list(&system(), &ConversationFilter::default())
        .await;
    let order: Vec<_> = all.iter().map(|c| c.id.clone()).collect();
    assert_eq!(order, vec![c1.id.clone(), c2.id.clone()]);

    let search = ConversationFilter {
        search: Some("TROCAR".into()),
        ..Default::default()
    };
    let found = f.router.list(&system(), &search).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, c2.id);

    let by_area = ConversationFilter {
        search: Some("55119".into()),
        ..Default::default()
    };
    assert_eq!(f.router.list(&system(), &by_area).await[0].id, c1.id);
}

#[tokio::test]
async fn test_outbound_reply_and_mark_read() {
    let f = fixture();
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    let c = inbound(&f, "C1", "oi").await.conversation;
    inbound(&f, "C1", "tudo bem?").await;

    let (after, reply) = f
        .router
        .append_outbound(&as_agent(&a1), &c.id, "Olá! Como posso ajudar?")
        .await
        .unwrap();
    assert_eq!(reply.author.as_ref(), Some(&a1));
    assert_eq!(reply.seq, 2);
    assert_eq!(after.unread_count, 2);

    assert!(matches!(
        f.router.append_outbound(&as_agent(&a1), &c.id, "   ").await,
        Err(ZapdeskError::Validation(_))
    ));

    let read = f.router.mark_read(&as_agent(&a1), &c.id).await.unwrap();
    assert_eq!(read.unread_count, 0);
    let log = f.router.messages(&as_agent(&a1), &c.id).await.unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|m| !m.is_unread_inbound()));
}

#[tokio::test]
async fn test_rebuild_ledger_counts_active_assignments() {
    let f = fixture();
    let a1 = seed_agent(&f, "a1", Presence::Online, 5);
    let c1 = inbound(&f, "C1", "oi").await.conversation;
    inbound(&f, "C2", "oi").await;
    f.router.close(&system(), &c1.id).await.unwrap();

    // A fresh router over the same table sees one active assignment.
    let ledger = Arc::new(AssignmentLedger::new());
    let rebuilt = ConversationRouter::new(
        f.store.clone(),
        ledger.clone(),
        f.directory.clone(),
        f.settings.clone(),
        f.persistence.clone(),
        f.feed.clone(),
    );
    assert_eq!(rebuilt.rebuild_ledger().await, 1);
    assert_eq!(ledger.open_count(&a1), 1);
}

// ── properties ─────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Assign { conversation: usize, agent: usize },
    Close { conversation: usize },
    Unassign { conversation: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..6usize, 0..3usize).prop_map(|(conversation, agent)| Op::Assign { conversation, agent }),
        1 => (0..6usize).prop_map(|conversation| Op::Close { conversation }),
        1 => (0..6usize).prop_map(|conversation| Op::Unassign { conversation }),
    ]
}

proptest! {
    #[test]
    fn prop_capacity_never_exceeded_and_failed_assign_changes_nothing(
        ops in prop::collection::vec(op_strategy(), 1..40),
        capacities in prop::collection::vec(1..4u32, 3),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture();
            disable_auto_assignment(&f);
            let agents: Vec<AgentId> = capacities
                .iter()
                .enumerate()
                .map(|(i, cap)| seed_agent(&f, &format!("a{i}"), Presence::Online, *cap))
                .collect();
            let mut conversations = Vec::new();
            for i in 0..6 {
                conversations.push(inbound(&f, &format!("C{i}"), "oi").await.conversation.id);
            }

            for op in ops {
                match op {
                    Op::Assign { conversation, agent } => {
                        let id = &conversations[conversation];
                        let before = f.router.get(&system(), id).await.unwrap();
                        if let Err(e) = f.router.assign(&system(), id, &agents[agent]).await {
                            let after = f.router.get(&system(), id).await.unwrap();
                            assert_eq!(before, after, "failed assign mutated state: {e}");
                        }
                    }
                    Op::Close { conversation } => {
                        let _ = f.router.close(&system(), &conversations[conversation]).await;
                    }
                    Op::Unassign { conversation } => {
                        let _ = f.router.unassign(&system(), &conversations[conversation]).await;
                    }
                }

                for (agent, cap) in agents.iter().zip(&capacities) {
                    let held = f
                        .router
                        .list(&system(), &ConversationFilter {
                            assigned: AssignedFilter::Agent(agent.clone()),
                            ..Default::default()
                        })
                        .await
                        .into_iter()
                        .filter(Conversation::holds_capacity)
                        .count() as u32;
                    assert!(held <= *cap);
                    assert_eq!(held, f.router.open_count(agent));
                }
            }
        });
    }
}
