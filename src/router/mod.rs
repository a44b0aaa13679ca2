//! Conversation routing: inbound dispatch, assignment, lifecycle, labels
//! and the read-side query API.
//!
//! Every mutation runs under the conversation's slot lock. Capacity checks
//! take the [`AssignmentLedger`] inside that lock, so the check and the
//! ledger update are one step: an assignment either commits completely or
//! fails before anything is visible.

mod filter;
mod ledger;

pub use filter::{AssignedFilter, ConversationFilter};
pub use ledger::{AssignmentLedger, LedgerGuard};

use crate::auth::Principal;
use crate::bus::{DomainEvent, EventFeed, NoticeKind};
use crate::config::{ConsoleSettings, SharedSettings};
use crate::directory::Directory;
use crate::errors::{ZapdeskError, ZapdeskResult};
use crate::model::{
    AgentId, Capability, ContactId, Conversation, ConversationId, ConversationStatus, Direction,
    LabelId, Message, NewMessage, Presence, Role,
};
use crate::persistence::Persistence;
use crate::store::{ConversationSlot, ConversationTable, MessageStore, SlotGuard};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError};
use tracing::{debug, info, warn};

/// Result of dispatching one inbound message.
#[derive(Debug, Clone)]
pub struct RoutedInbound {
    pub conversation: Conversation,
    pub message: Message,
    /// A new conversation was opened for this message.
    pub created: bool,
}

pub struct ConversationRouter {
    table: Arc<ConversationTable>,
    store: Arc<MessageStore>,
    ledger: Arc<AssignmentLedger>,
    directory: Arc<Directory>,
    settings: SharedSettings,
    persistence: Arc<dyn Persistence>,
    feed: Arc<EventFeed>,
}

impl ConversationRouter {
    pub fn new(
        store: Arc<MessageStore>,
        ledger: Arc<AssignmentLedger>,
        directory: Arc<Directory>,
        settings: SharedSettings,
        persistence: Arc<dyn Persistence>,
        feed: Arc<EventFeed>,
    ) -> Self {
        Self {
            table: store.table().clone(),
            store,
            ledger,
            directory,
            settings,
            persistence,
            feed,
        }
    }

    fn settings(&self) -> ConsoleSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rebuild the ledger from hydrated conversations.
    pub async fn rebuild_ledger(&self) -> usize {
        let mut assigned = 0;
        for conversation in self.table.conversations().await {
            if conversation.holds_capacity()
                && let Some(agent) = &conversation.assigned_agent
            {
                self.ledger.lock().add(agent, &conversation.id);
                assigned += 1;
            }
        }
        assigned
    }

    // ── inbound ────────────────────────────────────────────

    pub async fn route_inbound(
        &self,
        contact_id: &ContactId,
        body: impl Into<String>,
        source_timestamp: Option<DateTime<Utc>>,
    ) -> ZapdeskResult<RoutedInbound> {
        self.route_inbound_at(contact_id, body, source_timestamp, Utc::now())
            .await
    }

    /// Dispatch an inbound message as if it arrived at `at`. The arrival
    /// time only decides whether working hours allow auto-assignment.
    pub async fn route_inbound_at(
        &self,
        contact_id: &ContactId,
        body: impl Into<String>,
        source_timestamp: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> ZapdeskResult<RoutedInbound> {
        let (mut slot, created) = self.active_slot_for(contact_id).await?;
        let message = self
            .store
            .append_locked(&mut slot, NewMessage::inbound(body, source_timestamp))?;

        let settings = self.settings();
        if settings.notifications.new_message {
            self.feed.publish(DomainEvent::Notice {
                kind: NoticeKind::NewMessage,
                message: format!("new message from {contact_id}"),
                contact_id: Some(contact_id.clone()),
            });
        }

        if slot.conversation.assigned_agent.is_none() {
            if !settings.routing.auto_assignment {
                debug!("auto-assignment disabled, conversation stays queued");
            } else if !settings.working_hours.contains(at) {
                debug!(
                    "outside working hours, conversation stays queued: conversation={}",
                    slot.conversation.id
                );
            } else if let Err(e) = self.auto_assign_locked(&mut slot) {
                // The message is already stored; a failed assignment only
                // leaves the conversation in the queue.
                warn!(
                    "auto-assignment failed: conversation={} error={}",
                    slot.conversation.id, e
                );
            }
        }

        Ok(RoutedInbound {
            conversation: slot.conversation.clone(),
            message,
            created,
        })
    }

    /// Lock the contact's active conversation, creating it if needed.
    async fn active_slot_for(&self, contact_id: &ContactId) -> ZapdeskResult<(SlotGuard, bool)> {
        loop {
            let mut contacts = self.table.contacts().await;
            if let Some(id) = contacts.get(contact_id).cloned() {
                drop(contacts);
                let slot = self.table.lock(&id).await?;
                if slot.conversation.is_active() {
                    return Ok((slot, false));
                }
                // Closed while we waited; close() has already dropped the
                // contact mapping, so the next pass creates a fresh one.
                continue;
            }

            let conversation = Conversation::new(contact_id.clone());
            self.persistence
                .save_conversation(&conversation)
                .context("Failed to persist conversation")?;
            let slot = self
                .table
                .insert_locked(ConversationSlot {
                    conversation,
                    log: Vec::new(),
                })
                .await;
            contacts.insert(contact_id.clone(), slot.conversation.id.clone());
            drop(contacts);

            info!(
                "conversation created: conversation={} contact={}",
                slot.conversation.id, contact_id
            );
            self.feed.publish(DomainEvent::ConversationCreated {
                conversation: slot.conversation.clone(),
            });
            return Ok((slot, true));
        }
    }

    /// Pick the online agent with spare capacity and the fewest open
    /// conversations (ties by id) and assign. `Ok(None)` when nobody is
    /// free.
    fn auto_assign_locked(&self, slot: &mut ConversationSlot) -> ZapdeskResult<Option<AgentId>> {
        let mut ledger = self.ledger.lock();
        let candidate = self
            .directory
            .agents()
            .into_iter()
            .filter(|a| a.role == Role::Agent && a.presence == Presence::Online)
            .map(|a| (ledger.open_count(&a.id), a))
            .filter(|(open, a)| *open < a.capacity)
            .min_by(|(open_a, a), (open_b, b)| open_a.cmp(open_b).then_with(|| a.id.cmp(&b.id)));

        let Some((_, agent)) = candidate else {
            debug!(
                "no agent available, conversation stays queued: conversation={}",
                slot.conversation.id
            );
            return Ok(None);
        };
        self.commit_assignment(slot, &mut ledger, &agent.id)?;
        Ok(Some(agent.id))
    }

    // ── assignment ─────────────────────────────────────────

    /// Assign a conversation. Agents may only claim conversations for
    /// themselves; assigning someone else needs `AssignOthers`. Assigning
    /// the current assignee again is a no-op.
    pub async fn assign(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
        agent_id: &AgentId,
    ) -> ZapdeskResult<Conversation> {
        actor.require(Capability::HandleConversations)?;
        if !actor.is(agent_id) {
            actor.require(Capability::AssignOthers)?;
        }
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        self.assign_locked(&mut slot, agent_id, false)
    }

    /// Move an assigned conversation to another agent. Same checks as
    /// [`assign`](Self::assign); the conversation must already have an
    /// assignee.
    pub async fn reassign(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
        agent_id: &AgentId,
    ) -> ZapdeskResult<Conversation> {
        actor.require(Capability::HandleConversations)?;
        if !actor.is(agent_id) {
            actor.require(Capability::AssignOthers)?;
        }
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        self.assign_locked(&mut slot, agent_id, true)
    }

    fn assign_locked(
        &self,
        slot: &mut ConversationSlot,
        agent_id: &AgentId,
        require_assignee: bool,
    ) -> ZapdeskResult<Conversation> {
        let conversation = &slot.conversation;
        if conversation.status == ConversationStatus::Closed {
            return Err(ZapdeskError::InvalidState(format!(
                "conversation {} is closed",
                conversation.id
            )));
        }
        if require_assignee && conversation.assigned_agent.is_none() {
            return Err(ZapdeskError::InvalidState(format!(
                "conversation {} is not assigned",
                conversation.id
            )));
        }
        if conversation.assigned_agent.as_ref() == Some(agent_id) {
            return Ok(conversation.clone());
        }

        let mut ledger = self.ledger.lock();
        let agent = self.directory.agent(agent_id)?;
        if agent.presence == Presence::Offline {
            warn!(
                "assignment refused, agent offline: conversation={} agent={}",
                conversation.id, agent_id
            );
            return Err(ZapdeskError::AgentUnavailable {
                agent_id: agent_id.to_string(),
            });
        }
        let open = ledger.open_count(agent_id);
        if open >= agent.capacity {
            warn!(
                "assignment refused, agent at capacity: conversation={} agent={} open={} capacity={}",
                conversation.id, agent_id, open, agent.capacity
            );
            return Err(ZapdeskError::CapacityExceeded {
                agent_id: agent_id.to_string(),
                capacity: agent.capacity,
            });
        }

        self.commit_assignment(slot, &mut ledger, agent_id)?;
        Ok(slot.conversation.clone())
    }

    /// Persist, then apply the assignment to the slot and the ledger, then
    /// publish. Caller holds the slot and has passed the capacity checks.
    fn commit_assignment(
        &self,
        slot: &mut ConversationSlot,
        ledger: &mut LedgerGuard<'_>,
        agent_id: &AgentId,
    ) -> ZapdeskResult<()> {
        let mut conversation = slot.conversation.clone();
        let previous = conversation.assigned_agent.replace(agent_id.clone());
        let from = conversation.status;
        conversation.status = ConversationStatus::Open;

        self.persistence
            .save_conversation(&conversation)
            .context("Failed to persist assignment")?;

        if let Some(previous) = &previous {
            ledger.remove(previous, &conversation.id);
        }
        ledger.add(agent_id, &conversation.id);
        slot.conversation = conversation;

        info!(
            "conversation assigned: conversation={} agent={} previous={:?}",
            slot.conversation.id, agent_id, previous
        );
        self.feed.publish(DomainEvent::ConversationAssigned {
            conversation_id: slot.conversation.id.clone(),
            agent_id: agent_id.clone(),
            previous,
        });
        if from != ConversationStatus::Open {
            self.feed.publish(DomainEvent::ConversationStatusChanged {
                conversation_id: slot.conversation.id.clone(),
                from,
                to: ConversationStatus::Open,
            });
        }
        Ok(())
    }

    /// Return a conversation to the queue.
    pub async fn unassign(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
    ) -> ZapdeskResult<Conversation> {
        actor.require(Capability::HandleConversations)?;
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        if !slot.conversation.is_active() {
            return Err(ZapdeskError::InvalidState(format!(
                "conversation {} is closed",
                conversation_id
            )));
        }
        let Some(previous) = slot.conversation.assigned_agent.clone() else {
            return Err(ZapdeskError::InvalidState(format!(
                "conversation {} is not assigned",
                conversation_id
            )));
        };
        if !actor.is(&previous) {
            actor.require(Capability::AssignOthers)?;
        }

        let mut conversation = slot.conversation.clone();
        let from = conversation.status;
        conversation.assigned_agent = None;
        conversation.status = ConversationStatus::Pending;
        self.persistence
            .save_conversation(&conversation)
            .context("Failed to persist unassignment")?;

        self.ledger.lock().remove(&previous, conversation_id);
        slot.conversation = conversation;

        info!(
            "conversation unassigned: conversation={} previous={}",
            conversation_id, previous
        );
        self.feed.publish(DomainEvent::ConversationUnassigned {
            conversation_id: conversation_id.clone(),
            previous,
        });
        if from != ConversationStatus::Pending {
            self.feed.publish(DomainEvent::ConversationStatusChanged {
                conversation_id: conversation_id.clone(),
                from,
                to: ConversationStatus::Pending,
            });
        }
        Ok(slot.conversation.clone())
    }

    // ── lifecycle ──────────────────────────────────────────

    /// Archive a conversation. History and the assignee are kept; the
    /// agent's capacity is freed and the contact's next message opens a
    /// new conversation.
    pub async fn close(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
    ) -> ZapdeskResult<Conversation> {
        actor.require(Capability::HandleConversations)?;
        let mut contacts = self.table.contacts().await;
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        if !slot.conversation.is_active() {
            return Err(ZapdeskError::InvalidState(format!(
                "conversation {} is already closed",
                conversation_id
            )));
        }

        let mut conversation = slot.conversation.clone();
        let from = conversation.status;
        conversation.status = ConversationStatus::Closed;
        self.persistence
            .save_conversation(&conversation)
            .context("Failed to persist close")?;

        if let Some(agent) = &conversation.assigned_agent {
            self.ledger.lock().remove(agent, conversation_id);
        }
        if contacts.get(&conversation.contact_id) == Some(conversation_id) {
            contacts.remove(&conversation.contact_id);
        }
        drop(contacts);
        slot.conversation = conversation;

        info!("conversation closed: conversation={}", conversation_id);
        self.feed.publish(DomainEvent::ConversationStatusChanged {
            conversation_id: conversation_id.clone(),
            from,
            to: ConversationStatus::Closed,
        });
        Ok(slot.conversation.clone())
    }

    pub async fn reopen(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
    ) -> ZapdeskResult<Conversation> {
        self.reopen_at(actor, conversation_id, Utc::now()).await
    }

    /// Bring a closed conversation back to the queue, then apply
    /// auto-assignment as for a new inbound conversation. Refused while
    /// the contact has another active conversation.
    pub async fn reopen_at(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
        at: DateTime<Utc>,
    ) -> ZapdeskResult<Conversation> {
        actor.require(Capability::HandleConversations)?;
        let mut contacts = self.table.contacts().await;
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        if slot.conversation.status != ConversationStatus::Closed {
            return Err(ZapdeskError::InvalidState(format!(
                "conversation {} is not closed",
                conversation_id
            )));
        }
        if let Some(active) = contacts.get(&slot.conversation.contact_id) {
            return Err(ZapdeskError::InvalidState(format!(
                "contact {} already has active conversation {}",
                slot.conversation.contact_id, active
            )));
        }

        let mut conversation = slot.conversation.clone();
        let previous = conversation.assigned_agent.take();
        conversation.status = ConversationStatus::Pending;
        self.persistence
            .save_conversation(&conversation)
            .context("Failed to persist reopen")?;

        contacts.insert(conversation.contact_id.clone(), conversation_id.clone());
        drop(contacts);
        slot.conversation = conversation;

        info!("conversation reopened: conversation={}", conversation_id);
        if let Some(previous) = previous {
            self.feed.publish(DomainEvent::ConversationUnassigned {
                conversation_id: conversation_id.clone(),
                previous,
            });
        }
        self.feed.publish(DomainEvent::ConversationStatusChanged {
            conversation_id: conversation_id.clone(),
            from: ConversationStatus::Closed,
            to: ConversationStatus::Pending,
        });

        let settings = self.settings();
        if settings.routing.auto_assignment
            && settings.working_hours.contains(at)
            && let Err(e) = self.auto_assign_locked(&mut slot)
        {
            warn!(
                "auto-assignment failed: conversation={} error={}",
                conversation_id, e
            );
        }
        Ok(slot.conversation.clone())
    }

    // ── labels ─────────────────────────────────────────────

    pub async fn add_label(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
        label_id: &LabelId,
    ) -> ZapdeskResult<Conversation> {
        actor.require(Capability::HandleConversations)?;
        if !self.directory.has_label(label_id) {
            return Err(ZapdeskError::not_found("label", label_id));
        }
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        if slot.conversation.has_label(label_id) {
            return Ok(slot.conversation.clone());
        }
        let mut labels = slot.conversation.labels.clone();
        labels.push(label_id.clone());
        self.replace_labels(&mut slot, labels)?;
        Ok(slot.conversation.clone())
    }

    pub async fn remove_label(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
        label_id: &LabelId,
    ) -> ZapdeskResult<Conversation> {
        actor.require(Capability::HandleConversations)?;
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        if !slot.conversation.has_label(label_id) {
            return Ok(slot.conversation.clone());
        }
        let labels = slot
            .conversation
            .labels
            .iter()
            .filter(|l| *l != label_id)
            .cloned()
            .collect();
        self.replace_labels(&mut slot, labels)?;
        Ok(slot.conversation.clone())
    }

    /// Detach a deleted label from every conversation carrying it.
    pub async fn purge_label(&self, label_id: &LabelId) -> ZapdeskResult<usize> {
        let mut purged = 0;
        for handle in self.table.handles() {
            let mut slot = handle.lock_owned().await;
            if !slot.conversation.has_label(label_id) {
                continue;
            }
            let labels = slot
                .conversation
                .labels
                .iter()
                .filter(|l| *l != label_id)
                .cloned()
                .collect();
            self.replace_labels(&mut slot, labels)?;
            purged += 1;
        }
        if purged > 0 {
            info!(
                "label detached from conversations: label={} count={}",
                label_id, purged
            );
        }
        Ok(purged)
    }

    fn replace_labels(
        &self,
        slot: &mut ConversationSlot,
        labels: Vec<LabelId>,
    ) -> ZapdeskResult<()> {
        let mut conversation = slot.conversation.clone();
        conversation.labels = labels;
        self.persistence
            .save_conversation(&conversation)
            .context("Failed to persist labels")?;
        slot.conversation = conversation;
        self.feed.publish(DomainEvent::ConversationLabelsChanged {
            conversation_id: slot.conversation.id.clone(),
            labels: slot.conversation.labels.clone(),
        });
        Ok(())
    }

    // ── messages ───────────────────────────────────────────

    /// Append an agent reply (or a system message when `actor` is the
    /// system principal).
    pub async fn append_outbound(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
        body: &str,
    ) -> ZapdeskResult<(Conversation, Message)> {
        actor.require(Capability::HandleConversations)?;
        if body.trim().is_empty() {
            return Err(ZapdeskError::Validation("message body is empty".into()));
        }
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        let author = (!actor.is_system()).then(|| actor.agent_id.clone());
        let message = self
            .store
            .append_locked(&mut slot, NewMessage::outbound(author, body))?;
        Ok((slot.conversation.clone(), message))
    }

    /// Append a system message unless the conversation already has an
    /// outbound reply or is no longer active. Returns `None` when skipped.
    pub async fn append_if_unanswered(
        &self,
        conversation_id: &ConversationId,
        body: &str,
    ) -> ZapdeskResult<Option<(Conversation, Message)>> {
        let mut slot = self.table.lock(conversation_id).await?;
        let answered = slot
            .log
            .iter()
            .any(|m| m.direction == Direction::Outbound);
        if answered || !slot.conversation.is_active() {
            debug!(
                "automatic reply skipped: conversation={} answered={}",
                conversation_id, answered
            );
            return Ok(None);
        }
        let message = self
            .store
            .append_locked(&mut slot, NewMessage::outbound(None, body))?;
        Ok(Some((slot.conversation.clone(), message)))
    }

    pub async fn messages(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
    ) -> ZapdeskResult<Vec<Message>> {
        let slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        Ok(slot.log.clone())
    }

    pub async fn mark_read(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
    ) -> ZapdeskResult<Conversation> {
        actor.require(Capability::HandleConversations)?;
        let mut slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        let reader = (!actor.is_system()).then(|| actor.agent_id.clone());
        self.store.mark_read_locked(&mut slot, reader)
    }

    // ── queries ────────────────────────────────────────────

    pub async fn get(
        &self,
        actor: &Principal,
        conversation_id: &ConversationId,
    ) -> ZapdeskResult<Conversation> {
        let slot = self.table.lock(conversation_id).await?;
        ensure_visible(actor, &slot.conversation)?;
        Ok(slot.conversation.clone())
    }

    /// Conversations visible to `actor` that match `filter`, most recent
    /// activity first.
    pub async fn list(&self, actor: &Principal, filter: &ConversationFilter) -> Vec<Conversation> {
        let mut out: Vec<Conversation> = self
            .table
            .conversations()
            .await
            .into_iter()
            .filter(|c| is_visible(actor, c) && filter.matches(c))
            .collect();
        out.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Whether `actor` may see a feed event. Conversation events follow
    /// the same visibility as [`Self::get`], judged on the conversation as
    /// it stands now; the agents named in an assignment change always see it.
    pub async fn can_observe(&self, actor: &Principal, event: &DomainEvent) -> bool {
        if let DomainEvent::CredentialIssued { .. } = event {
            return actor.can(Capability::ManageSession);
        }
        if actor.can(Capability::ViewAllConversations) {
            return true;
        }
        let conversation_id = match event {
            DomainEvent::ConversationAssigned {
                agent_id, previous, ..
            } if actor.is(agent_id) || previous.as_ref().is_some_and(|p| actor.is(p)) => {
                return true;
            }
            DomainEvent::ConversationUnassigned { previous, .. } if actor.is(previous) => {
                return true;
            }
            DomainEvent::Notice {
                contact_id: Some(contact),
                ..
            } => {
                let Some(id) = self.table.contacts().await.get(contact).cloned() else {
                    return false;
                };
                id
            }
            other => match other.conversation_id() {
                Some(id) => id.clone(),
                None => return true,
            },
        };
        match self.table.lock(&conversation_id).await {
            Ok(slot) => is_visible(actor, &slot.conversation),
            Err(_) => false,
        }
    }

    /// Open and pending conversations currently held by an agent.
    pub fn open_count(&self, agent_id: &AgentId) -> u32 {
        self.ledger.open_count(agent_id)
    }
}

/// Admins see everything; agents see their own conversations and the
/// unassigned queue.
fn is_visible(actor: &Principal, conversation: &Conversation) -> bool {
    actor.can(Capability::ViewAllConversations)
        || match &conversation.assigned_agent {
            None => true,
            Some(agent) => actor.is(agent),
        }
}

fn ensure_visible(actor: &Principal, conversation: &Conversation) -> ZapdeskResult<()> {
    if is_visible(actor, conversation) {
        Ok(())
    } else {
        Err(ZapdeskError::Forbidden(format!(
            "conversation {} belongs to another agent",
            conversation.id
        )))
    }
}

#[cfg(test)]
mod tests;
