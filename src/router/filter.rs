use crate::model::{AgentId, Conversation, ConversationStatus, LabelId};

/// Assignment criterion of a conversation query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AssignedFilter {
    #[default]
    Any,
    Agent(AgentId),
    Unassigned,
}

/// Query over the conversation table. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub assigned: AssignedFilter,
    pub label: Option<LabelId>,
    pub status: Option<ConversationStatus>,
    /// Case-insensitive substring of the contact id or the last message
    /// preview.
    pub search: Option<String>,
}

impl ConversationFilter {
    pub fn matches(&self, conversation: &Conversation) -> bool {
        let assigned = match &self.assigned {
            AssignedFilter::Any => true,
            AssignedFilter::Agent(id) => conversation.assigned_agent.as_ref() == Some(id),
            AssignedFilter::Unassigned => conversation.assigned_agent.is_none(),
        };
        if !assigned {
            return false;
        }
        if let Some(label) = &self.label
            && !conversation.has_label(label)
        {
            return false;
        }
        if let Some(status) = self.status
            && conversation.status != status
        {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(term) => {
                let term = term.to_lowercase();
                conversation
                    .contact_id
                    .as_str()
                    .to_lowercase()
                    .contains(&term)
                    || conversation
                        .last_message_preview
                        .to_lowercase()
                        .contains(&term)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContactId;

    fn conversation(contact: &str, preview: &str) -> Conversation {
        let mut c = Conversation::new(ContactId::from(contact));
        c.set_preview(preview);
        c
    }

    #[test]
    fn test_default_filter_matches_everything() {
        let c = conversation("5511999990000", "oi");
        assert!(ConversationFilter::default().matches(&c));
    }

    #[test]
    fn test_assigned_filter() {
        let mut c = conversation("5511999990000", "oi");
        let unassigned = ConversationFilter {
            assigned: AssignedFilter::Unassigned,
            ..Default::default()
        };
        let mine = ConversationFilter {
            assigned: AssignedFilter::Agent(AgentId::from("a1")),
            ..Default::default()
        };
        assert!(unassigned.matches(&c));
        assert!(!mine.matches(&c));

        c.assigned_agent = Some(AgentId::from("a1"));
        assert!(!unassigned.matches(&c));
        assert!(mine.matches(&c));
    }

    #[test]
    fn test_search_is_case_insensitive_over_contact_and_preview() {
        let c = conversation("5511999990000", "Quero CANCELAR meu pedido");
        let search = |term: &str| ConversationFilter {
            search: Some(term.into()),
            ..Default::default()
        };
        assert!(search("cancelar").matches(&c));
        assert!(search("99999").matches(&c));
        assert!(search("  ").matches(&c));
        assert!(!search("reembolso").matches(&c));
    }

    #[test]
    fn test_label_and_status_filters() {
        let mut c = conversation("5511999990000", "oi");
        c.labels.push(LabelId::from("vip"));
        let by_label = |id: &str| ConversationFilter {
            label: Some(LabelId::from(id)),
            ..Default::default()
        };
        assert!(by_label("vip").matches(&c));
        assert!(!by_label("spam").matches(&c));

        let closed = ConversationFilter {
            status: Some(ConversationStatus::Closed),
            ..Default::default()
        };
        assert!(!closed.matches(&c));
    }
}
