//! Client-side reconciliation of the message log.
//!
//! [`ConversationStore`] keeps, for the signed-in user, the conversation list
//! (one entry per counterpart, most recent first) and the active thread with
//! the selected counterpart (oldest first). It performs no I/O: every
//! operation that would await the backend is split into a synchronous
//! request step and a synchronous apply step, so the session task can run
//! the I/O concurrently and feed results back in any order.
//!
//! Invariants maintained by every operation:
//!
//! * the active thread holds each message id at most once and is ordered by
//!   `created_at` ascending, ties in arrival order;
//! * there is at most one conversation per counterpart, and its
//!   `last_message` is the newest message known for that counterpart;
//! * conversations without a message come first (most recently started
//!   first), then the rest by `last_message.created_at` descending, ties in
//!   most-recently-touched order.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use launchpad_shared::rows::validate_body;
use launchpad_shared::types::{Conversation, Message, MessageId, Participant, ParticipantId};

use crate::directory::Directory;
use crate::error::MessagingError;

/// Request for the history of one selection.
///
/// Only the ticket of the latest selection is honoured by
/// [`ConversationStore::apply_thread`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadTicket {
    generation: u64,
    pub current_user: ParticipantId,
    pub counterpart: Participant,
}

impl ThreadTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadOutcome {
    /// The fetched history replaced the active thread.
    Applied,
    /// The selection changed since the fetch was issued; result discarded.
    Stale,
    /// The fetch failed; the thread is empty and the error flag is set.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The message does not involve the current user.
    Ignored,
    Applied { thread_changed: bool },
}

/// A validated send waiting for the persistence result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    token: Uuid,
    pub sender: ParticipantId,
    pub receiver: ParticipantId,
    pub body: String,
}

#[derive(Debug)]
struct PendingSend {
    token: Uuid,
    sender: ParticipantId,
    receiver: ParticipantId,
    body: String,
    /// Realtime echo observed while the persist call was in flight.
    echo: Option<Message>,
}

impl PendingSend {
    fn is_echoed_by(&self, message: &Message) -> bool {
        self.echo.is_none()
            && !message.is_optimistic()
            && message.sender_id == self.sender
            && message.receiver_id == self.receiver
            && message.body == self.body
    }
}

pub struct ConversationStore {
    current_user: Participant,
    directory: Directory,
    conversations: Vec<Conversation>,
    active_thread: Vec<Message>,
    selected: Option<Participant>,
    generation: u64,
    pending: Vec<PendingSend>,
    load_error: Option<MessagingError>,
    thread_error: Option<MessagingError>,
}

impl ConversationStore {
    pub fn new(current_user: Participant) -> Self {
        Self {
            current_user,
            directory: Directory::default(),
            conversations: Vec::new(),
            active_thread: Vec::new(),
            selected: None,
            generation: 0,
            pending: Vec::new(),
            load_error: None,
            thread_error: None,
        }
    }

    pub fn current_user(&self) -> &Participant {
        &self.current_user
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn active_thread(&self) -> &[Message] {
        &self.active_thread
    }

    pub fn selected(&self) -> Option<&Participant> {
        self.selected.as_ref()
    }

    pub fn load_error(&self) -> Option<&MessagingError> {
        self.load_error.as_ref()
    }

    pub fn thread_error(&self) -> Option<&MessagingError> {
        self.thread_error.as_ref()
    }

    // ------------------------------------------------------------------
    // Initial load
    // ------------------------------------------------------------------

    /// Build the conversation list from the user's full message history.
    ///
    /// Entries created before the history arrived (live inserts, a started
    /// conversation) are kept and merged with the history.
    pub fn initialize(&mut self, directory: Directory, history: Vec<Message>) {
        self.set_directory(directory);
        self.load_error = None;

        let me = self.current_user.uuid.clone();
        let mut index: HashMap<ParticipantId, usize> = self
            .conversations
            .iter()
            .enumerate()
            .map(|(i, c)| (c.counterpart.uuid.clone(), i))
            .collect();

        let total = history.len();
        for message in history {
            let Some(partner) = message.counterpart_of(&me).cloned() else {
                continue;
            };
            match index.get(&partner) {
                Some(&i) => {
                    let entry = &mut self.conversations[i];
                    if supersedes(&message, entry.last_message.as_ref()) {
                        entry.last_message = Some(message);
                    }
                }
                None => {
                    index.insert(partner.clone(), self.conversations.len());
                    self.conversations.push(Conversation {
                        counterpart: self.directory.resolve(&partner),
                        last_message: Some(message),
                    });
                }
            }
        }
        sort_conversations(&mut self.conversations);

        info!(
            user = %me,
            messages = total,
            conversations = self.conversations.len(),
            "Conversations initialized"
        );
    }

    /// Record a failed history load. No automatic retry.
    pub fn fail_initialize(&mut self, error: MessagingError) {
        warn!(error = %error, "Failed to load message history");
        self.load_error = Some(error);
    }

    /// Replace the directory and re-resolve the names already displayed.
    pub fn set_directory(&mut self, directory: Directory) {
        self.directory = directory;
        for conversation in &mut self.conversations {
            if let Some(known) = self.directory.find(&conversation.counterpart.uuid) {
                conversation.counterpart = known.clone();
            }
        }
        if let Some(selected) = self.selected.as_mut() {
            if let Some(known) = self.directory.find(&selected.uuid) {
                *selected = known.clone();
            }
        }
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Select `participant` and return the ticket for its thread fetch.
    ///
    /// A conversation without a message is started if none exists yet.
    pub fn select_counterpart(&mut self, participant: Participant) -> ThreadTicket {
        self.generation += 1;
        self.active_thread.clear();
        self.thread_error = None;

        let counterpart = match self.position(&participant.uuid) {
            Some(i) => self.conversations[i].counterpart.clone(),
            None => {
                debug!(counterpart = %participant.uuid, "Starting new conversation");
                self.conversations.insert(
                    0,
                    Conversation {
                        counterpart: participant.clone(),
                        last_message: None,
                    },
                );
                sort_conversations(&mut self.conversations);
                participant
            }
        };
        self.selected = Some(counterpart.clone());

        ThreadTicket {
            generation: self.generation,
            current_user: self.current_user.uuid.clone(),
            counterpart,
        }
    }

    /// Select a directory user by row id or uuid. Returns `None` for unknown
    /// keys and for the current user.
    pub fn start_conversation(&mut self, key: &str) -> Option<ThreadTicket> {
        let user = self.directory.lookup(key)?.clone();
        if user.uuid == self.current_user.uuid {
            return None;
        }
        Some(self.select_counterpart(user))
    }

    /// Apply the result of a thread fetch.
    pub fn apply_thread(
        &mut self,
        ticket: &ThreadTicket,
        result: Result<Vec<Message>, MessagingError>,
    ) -> ThreadOutcome {
        if ticket.generation != self.generation {
            debug!(
                counterpart = %ticket.counterpart.uuid,
                generation = ticket.generation,
                current = self.generation,
                "Discarding stale thread fetch"
            );
            return ThreadOutcome::Stale;
        }

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!(counterpart = %ticket.counterpart.uuid, error = %error, "Thread fetch failed");
                self.active_thread.clear();
                self.thread_error = Some(error);
                return ThreadOutcome::Failed;
            }
        };

        let me = &self.current_user.uuid;
        let partner = &ticket.counterpart.uuid;

        let mut thread: Vec<Message> = fetched
            .into_iter()
            .filter(|m| m.is_between(me, partner))
            .collect();
        thread.sort_by_key(|m| m.created_at);
        let mut seen = HashSet::new();
        thread.retain(|m| seen.insert(m.id));

        // Live inserts delivered since the selection are newer than the
        // fetch was issued; keep them unless the fetch already confirms them.
        for live in std::mem::take(&mut self.active_thread) {
            if live.is_optimistic() && thread.iter().any(|m| m.confirms(&live)) {
                continue;
            }
            merge_into_thread(&mut thread, live);
        }

        if let Some(latest) = thread.last().cloned() {
            if let Some(i) = self.position(partner) {
                if supersedes(&latest, self.conversations[i].last_message.as_ref()) {
                    self.conversations[i].last_message = Some(latest);
                    sort_conversations(&mut self.conversations);
                }
            }
        }

        debug!(counterpart = %partner, messages = thread.len(), "Thread loaded");
        self.active_thread = thread;
        self.thread_error = None;
        ThreadOutcome::Applied
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Validate a send. Visible state is untouched until
    /// [`apply_sent`](Self::apply_sent) reports a successful persist.
    pub fn prepare_send(&mut self, text: &str) -> Result<OutgoingMessage, MessagingError> {
        let body = text.trim();
        validate_body(body)?;

        let receiver = self
            .selected
            .as_ref()
            .map(|p| p.uuid.clone())
            .ok_or(MessagingError::NoCounterpart)?;
        if receiver == self.current_user.uuid {
            return Err(MessagingError::SelfMessage);
        }

        let outgoing = OutgoingMessage {
            token: Uuid::new_v4(),
            sender: self.current_user.uuid.clone(),
            receiver,
            body: body.to_string(),
        };
        self.pending.push(PendingSend {
            token: outgoing.token,
            sender: outgoing.sender.clone(),
            receiver: outgoing.receiver.clone(),
            body: outgoing.body.clone(),
            echo: None,
        });
        Ok(outgoing)
    }

    /// Reflect a successfully persisted send.
    ///
    /// `echo` is the row returned by the store, if any. Without one, the
    /// realtime echo seen while persisting is used, and failing that an
    /// optimistic message with a local id is synthesized.
    pub fn apply_sent(&mut self, outgoing: OutgoingMessage, echo: Option<Message>) -> Message {
        let seen = self.take_pending(outgoing.token).and_then(|p| p.echo);

        let message = echo.or(seen).unwrap_or_else(|| Message {
            id: MessageId::new_local(),
            sender_id: outgoing.sender.clone(),
            receiver_id: outgoing.receiver.clone(),
            body: outgoing.body.clone(),
            created_at: Utc::now(),
        });

        if self.is_selected_pair(&message) {
            merge_into_thread(&mut self.active_thread, message.clone());
        }
        let resolved = self.directory.resolve(&outgoing.receiver);
        upsert_conversation(&mut self.conversations, &outgoing.receiver, message.clone(), |_| {
            resolved
        });

        info!(
            msg_id = %message.id,
            receiver = %outgoing.receiver,
            optimistic = message.is_optimistic(),
            "Message sent"
        );
        message
    }

    /// Forget a send whose persist failed. Nothing visible changes.
    pub fn abandon_send(&mut self, outgoing: &OutgoingMessage) {
        self.take_pending(outgoing.token);
    }

    // ------------------------------------------------------------------
    // Live updates
    // ------------------------------------------------------------------

    /// Reconcile a message inserted by any client, including this one.
    pub fn on_remote_insert(&mut self, message: Message) -> RemoteOutcome {
        let Some(partner) = message.counterpart_of(&self.current_user.uuid).cloned() else {
            return RemoteOutcome::Ignored;
        };

        if let Some(pending) = self.pending.iter_mut().find(|p| p.is_echoed_by(&message)) {
            pending.echo = Some(message.clone());
        }

        let thread_changed =
            self.is_selected_pair(&message) && merge_into_thread(&mut self.active_thread, message.clone());

        let directory = &self.directory;
        upsert_conversation(&mut self.conversations, &partner, message, |id| {
            directory.resolve(id)
        });

        RemoteOutcome::Applied { thread_changed }
    }

    // ------------------------------------------------------------------
    // Directory queries
    // ------------------------------------------------------------------

    /// Users offered as new conversation partners: founders and investors,
    /// or everyone if the directory has neither. Never the current user.
    pub fn eligible_counterparts(&self) -> Vec<Participant> {
        let others: Vec<&Participant> = self
            .directory
            .users()
            .iter()
            .filter(|u| u.uuid != self.current_user.uuid)
            .collect();

        let eligible: Vec<Participant> = others
            .iter()
            .filter(|u| u.role.is_some_and(|r| r.is_messaging_eligible()))
            .map(|u| (*u).clone())
            .collect();

        if eligible.is_empty() {
            others.into_iter().cloned().collect()
        } else {
            eligible
        }
    }

    fn position(&self, counterpart: &ParticipantId) -> Option<usize> {
        self.conversations
            .iter()
            .position(|c| &c.counterpart.uuid == counterpart)
    }

    fn is_selected_pair(&self, message: &Message) -> bool {
        self.selected
            .as_ref()
            .is_some_and(|s| message.is_between(&self.current_user.uuid, &s.uuid))
    }

    fn take_pending(&mut self, token: Uuid) -> Option<PendingSend> {
        let idx = self.pending.iter().position(|p| p.token == token)?;
        Some(self.pending.remove(idx))
    }
}

// ---------------------------------------------------------------------------
// Merge functions
// ---------------------------------------------------------------------------

/// Insert `message` into an ascending thread.
///
/// Returns `false` if a message with the same id is already present. A
/// persisted message replaces the optimistic entry it confirms.
pub fn merge_into_thread(thread: &mut Vec<Message>, message: Message) -> bool {
    if thread.iter().any(|m| m.id == message.id) {
        return false;
    }
    if let Some(pos) = thread.iter().position(|m| message.confirms(m)) {
        thread.remove(pos);
    }
    let at = thread.partition_point(|m| m.created_at <= message.created_at);
    thread.insert(at, message);
    true
}

/// Find-or-create the conversation with `partner`, record `message` if it is
/// newer than the current preview, move the entry to the front and re-sort.
pub fn upsert_conversation(
    conversations: &mut Vec<Conversation>,
    partner: &ParticipantId,
    message: Message,
    resolve: impl FnOnce(&ParticipantId) -> Participant,
) {
    let mut entry = match conversations
        .iter()
        .position(|c| &c.counterpart.uuid == partner)
    {
        Some(i) => conversations.remove(i),
        None => Conversation {
            counterpart: resolve(partner),
            last_message: None,
        },
    };

    if supersedes(&message, entry.last_message.as_ref()) {
        entry.last_message = Some(message);
    }

    conversations.insert(0, entry);
    sort_conversations(conversations);
}

/// Stable sort: message-less conversations first, then newest first.
pub fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| recency_order(a.last_activity(), b.last_activity()));
}

fn recency_order(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => b.cmp(&a),
    }
}

/// Newest wins; a persisted echo always replaces the optimistic entry it
/// confirms.
fn supersedes(incoming: &Message, current: Option<&Message>) -> bool {
    match current {
        None => true,
        Some(current) => {
            incoming.id != current.id
                && (incoming.created_at > current.created_at || incoming.confirms(current))
        }
    }
}
