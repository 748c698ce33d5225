//! Merge rules for view state fed by three sources: realtime pushes,
//! optimistic local sends and polled snapshots.
//!
//! Ordering between sources is not guaranteed, so every merge is idempotent:
//! - Confirmed messages are deduplicated by id
//! - A confirmed echo replaces the first matching optimistic placeholder
//! - A polled snapshot only replaces state when it is strictly newer
//! - Unmatched placeholders expire after a TTL

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::protocol::{ChatMessage, Notification};
use super::{ConversationId, MessageId, UserId};

/// Result of merging a confirmed message into a timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New message appended
    Appended,
    /// A message with this id was already present
    Duplicate,
    /// An optimistic placeholder was replaced by the confirmed copy
    ReplacedPlaceholder,
}

/// Messages of one conversation
#[derive(Debug)]
pub struct MessageTimeline {
    messages: Vec<ChatMessage>,
    /// Highest confirmed id, 0 when empty
    latest_id: MessageId,
    /// Creation time of each pending placeholder, by client key
    pending: HashMap<Uuid, Instant>,
    next_local_id: MessageId,
}

impl Default for MessageTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            latest_id: 0,
            pending: HashMap::new(),
            next_local_id: -1,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn latest_id(&self) -> MessageId {
        self.latest_id
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Append an optimistic placeholder for a message being sent
    pub fn push_placeholder(
        &mut self,
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: &str,
        content: &str,
        client_key: Uuid,
        now: Instant,
    ) -> ChatMessage {
        let placeholder = ChatMessage {
            id: self.next_local_id,
            conversation_id,
            sender_id,
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            read: false,
            client_key: Some(client_key),
            local_only: true,
        };
        self.next_local_id -= 1;
        self.pending.insert(client_key, now);
        self.messages.push(placeholder.clone());
        placeholder
    }

    /// Merge a server-confirmed message
    pub fn insert_confirmed(&mut self, mut message: ChatMessage) -> InsertOutcome {
        message.local_only = false;
        if self
            .messages
            .iter()
            .any(|m| !m.is_placeholder() && m.id == message.id)
        {
            return InsertOutcome::Duplicate;
        }

        let outcome = match self.take_placeholder(&message) {
            Some(_) => InsertOutcome::ReplacedPlaceholder,
            None => InsertOutcome::Appended,
        };

        self.latest_id = self.latest_id.max(message.id);
        self.messages.push(message);
        outcome
    }

    /// Remove the first placeholder matching a confirmed message.
    ///
    /// With a client key only an exact key match counts; otherwise a
    /// placeholder from the same sender with identical content matches.
    fn take_placeholder(&mut self, confirmed: &ChatMessage) -> Option<ChatMessage> {
        let index = self
            .messages
            .iter()
            .position(|m| placeholder_matches(m, confirmed))?;
        let removed = self.messages.remove(index);
        if let Some(key) = removed.client_key {
            self.pending.remove(&key);
        }
        Some(removed)
    }

    /// Replace state with a polled snapshot if it is strictly newer.
    ///
    /// Returns false and leaves state untouched when the snapshot's highest
    /// id does not exceed the local latest id. Placeholders the snapshot does
    /// not confirm are kept.
    pub fn replace_if_newer(&mut self, snapshot: Vec<ChatMessage>) -> bool {
        let Some(server_max) = snapshot.iter().map(|m| m.id).max() else {
            return false;
        };
        if server_max <= self.latest_id {
            return false;
        }

        let mut next: Vec<ChatMessage> = snapshot
            .into_iter()
            .map(|mut m| {
                m.local_only = false;
                m
            })
            .collect();

        // Each confirmed message may consume at most one placeholder
        let mut consumed = vec![false; next.len()];
        let placeholders: Vec<ChatMessage> = self
            .messages
            .drain(..)
            .filter(|m| m.is_placeholder())
            .collect();
        for placeholder in placeholders {
            let matched = next
                .iter()
                .enumerate()
                .position(|(i, m)| !consumed[i] && placeholder_matches(&placeholder, m));
            match matched {
                Some(i) => {
                    consumed[i] = true;
                    if let Some(key) = placeholder.client_key {
                        self.pending.remove(&key);
                    }
                }
                None => next.push(placeholder),
            }
        }

        self.messages = next;
        self.latest_id = server_max;
        true
    }

    /// Drop placeholders older than `ttl`; returns how many were removed
    pub fn expire_placeholders(&mut self, now: Instant, ttl: Duration) -> usize {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, created)| now.saturating_duration_since(**created) >= ttl)
            .map(|(key, _)| *key)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        for key in &expired {
            self.pending.remove(key);
        }
        let before = self.messages.len();
        self.messages.retain(|m| {
            !(m.is_placeholder() && m.client_key.map_or(false, |k| expired.contains(&k)))
        });
        before - self.messages.len()
    }

    /// Drop one placeholder by client key
    pub fn discard_placeholder(&mut self, client_key: Uuid) -> bool {
        self.pending.remove(&client_key);
        let before = self.messages.len();
        self.messages
            .retain(|m| !(m.is_placeholder() && m.client_key == Some(client_key)));
        before != self.messages.len()
    }

    /// Mark confirmed messages up to `through` as read by `reader_id`.
    ///
    /// A reader never marks their own messages. Returns how many changed.
    pub fn mark_read_through(&mut self, reader_id: UserId, through: MessageId) -> usize {
        let mut changed = 0;
        for m in self.messages.iter_mut() {
            if !m.is_placeholder() && m.id <= through && m.sender_id != reader_id && !m.read {
                m.read = true;
                changed += 1;
            }
        }
        changed
    }

    /// Highest unread message id not authored by `user_id`
    pub fn latest_unread_from_others(&self, user_id: UserId) -> Option<MessageId> {
        self.messages
            .iter()
            .filter(|m| !m.is_placeholder() && !m.read && m.sender_id != user_id)
            .map(|m| m.id)
            .max()
    }
}

fn placeholder_matches(placeholder: &ChatMessage, confirmed: &ChatMessage) -> bool {
    if !placeholder.is_placeholder() {
        return false;
    }
    match confirmed.client_key {
        Some(key) => placeholder.client_key == Some(key),
        None => {
            placeholder.id < 0
                && placeholder.sender_id == confirmed.sender_id
                && placeholder.content == confirmed.content
        }
    }
}

/// Notifications, newest first, with an unread counter
#[derive(Debug, Default)]
pub struct NotificationFeed {
    items: Vec<Notification>,
    unread: u32,
    /// Highest id any fetch has returned
    fetched_max: i64,
    /// Ids pushed since the last reconcile
    pushed: HashSet<i64>,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    /// Prepend a pushed notification; false if already present
    pub fn insert(&mut self, notification: Notification) -> bool {
        if self.items.iter().any(|n| n.id == notification.id) {
            return false;
        }
        if !notification.read {
            self.unread = self.unread.saturating_add(1);
        }
        self.pushed.insert(notification.id);
        self.items.insert(0, notification);
        true
    }

    /// Replace the counter with an authoritative value
    pub fn set_unread(&mut self, count: i64) {
        self.unread = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
    }

    pub fn mark_read(&mut self, id: i64) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(n) if !n.read => {
                n.read = true;
                self.unread = self.unread.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        for n in self.items.iter_mut() {
            n.read = true;
        }
        self.unread = 0;
    }

    /// Adopt a fetched list and count.
    ///
    /// Items pushed since the previous reconcile that are newer than every
    /// id fetched so far stay on top; everything else comes from `fetched`.
    pub fn reconcile(&mut self, fetched: Vec<Notification>, unread: u32) {
        let high = fetched
            .iter()
            .map(|n| n.id)
            .fold(self.fetched_max, i64::max);
        let pushed = std::mem::take(&mut self.pushed);
        let mut items: Vec<Notification> = self
            .items
            .drain(..)
            .filter(|n| n.id > high && pushed.contains(&n.id))
            .filter(|n| !fetched.iter().any(|f| f.id == n.id))
            .collect();
        items.extend(fetched);
        self.items = items;
        self.unread = unread;
        self.fetched_max = high;
    }
}
