use crate::model::{AgentId, ConversationId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Which active conversations each agent currently holds.
///
/// Capacity checks and the matching ledger update happen under one guard,
/// taken while the conversation's slot is locked, so two concurrent
/// assignments can never both claim an agent's last free seat.
#[derive(Default)]
pub struct AssignmentLedger {
    open: Mutex<HashMap<AgentId, BTreeSet<ConversationId>>>,
}

pub struct LedgerGuard<'a> {
    open: MutexGuard<'a, HashMap<AgentId, BTreeSet<ConversationId>>>,
}

impl AssignmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> LedgerGuard<'_> {
        LedgerGuard {
            open: self.open.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn open_count(&self, agent_id: &AgentId) -> u32 {
        self.lock().open_count(agent_id)
    }

    pub fn counts(&self) -> HashMap<AgentId, u32> {
        let guard = self.lock();
        guard
            .open
            .iter()
            .map(|(agent, set)| (agent.clone(), set.len() as u32))
            .collect()
    }
}

impl LedgerGuard<'_> {
    pub fn open_count(&self, agent_id: &AgentId) -> u32 {
        self.open.get(agent_id).map_or(0, |set| set.len() as u32)
    }

    pub fn add(&mut self, agent_id: &AgentId, conversation_id: &ConversationId) {
        self.open
            .entry(agent_id.clone())
            .or_default()
            .insert(conversation_id.clone());
    }

    pub fn remove(&mut self, agent_id: &AgentId, conversation_id: &ConversationId) {
        if let Some(set) = self.open.get_mut(agent_id) {
            set.remove(conversation_id);
            if set.is_empty() {
                self.open.remove(agent_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove_track_counts() {
        let ledger = AssignmentLedger::new();
        let agent = AgentId::from("a1");
        {
            let mut guard = ledger.lock();
            guard.add(&agent, &ConversationId::from("c1"));
            guard.add(&agent, &ConversationId::from("c2"));
            // re-adding is idempotent
            guard.add(&agent, &ConversationId::from("c2"));
        }
        assert_eq!(ledger.open_count(&agent), 2);

        ledger.lock().remove(&agent, &ConversationId::from("c1"));
        assert_eq!(ledger.open_count(&agent), 1);
        ledger.lock().remove(&agent, &ConversationId::from("c2"));
        assert_eq!(ledger.open_count(&agent), 0);
        assert!(ledger.counts().is_empty());
    }
}
