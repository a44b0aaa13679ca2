use super::*;

#[test]
fn test_transport_inbound_deserializes_camel_case() {
    let json = r#"{"type":"inbound_message","contactId":"5511999991234","body":"oi"}"#;
    let event: TransportEvent = serde_json::from_str(json).unwrap();
    assert_eq!(
        event,
        TransportEvent::InboundMessage {
            contact_id: "5511999991234".into(),
            body: "oi".into(),
            timestamp: None,
        }
    );
    assert_eq!(event.kind(), "inbound_message");
}

#[test]
fn test_transport_connection_state_deserializes() {
    let json = r#"{"type":"connection_state_changed","state":{"status":"connected","phone":"5511900000000","credential":"blob"}}"#;
    let event: TransportEvent = serde_json::from_str(json).unwrap();
    match event {
        TransportEvent::ConnectionStateChanged {
            state: TransportState::Connected { phone, credential },
        } => {
            assert_eq!(phone, "5511900000000");
            assert_eq!(credential, Credential("blob".into()));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn test_delivery_receipt_deserializes() {
    let json = r#"{"type":"delivery_receipt","messageId":"m-1","status":"read"}"#;
    let event: TransportEvent = serde_json::from_str(json).unwrap();
    assert_eq!(
        event,
        TransportEvent::DeliveryReceipt {
            message_id: MessageId::from("m-1"),
            status: DeliveryStatus::Read,
        }
    );
}

#[test]
fn test_unknown_transport_event_rejected() {
    let json = r#"{"type":"typing","contactId":"1"}"#;
    assert!(serde_json::from_str::<TransportEvent>(json).is_err());
}

#[test]
fn test_feed_event_serializes_flat() {
    let event = FeedEvent {
        seq: 7,
        at: Utc::now(),
        event: DomainEvent::ConversationAssigned {
            conversation_id: ConversationId::from("c-1"),
            agent_id: AgentId::from("a-1"),
            previous: None,
        },
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["seq"], 7);
    assert_eq!(json["type"], "conversation_assigned");
    assert_eq!(json["conversationId"], "c-1");
    assert_eq!(json["agentId"], "a-1");
}

#[test]
fn test_conversation_id_of_events() {
    let event = DomainEvent::ConversationRead {
        conversation_id: ConversationId::from("c-9"),
        agent_id: None,
    };
    assert_eq!(event.conversation_id().map(|c| c.as_str()), Some("c-9"));
    assert_eq!(event.name(), "conversation_read");

    let session = DomainEvent::SessionStateChanged {
        state: SessionState::Connected,
        failure: None,
    };
    assert!(session.conversation_id().is_none());
}
