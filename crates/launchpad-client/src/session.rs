//! Messaging session: one task that owns the [`ConversationStore`].
//!
//! All state mutation happens inside the session task. Backend calls run on
//! spawned tasks and report back through an internal queue, so a slow thread
//! fetch never blocks sends or realtime inserts, and completions may arrive
//! in any order. Out-of-date thread fetches are dropped by the store's
//! generation check.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use launchpad_shared::types::{Conversation, Message, Participant};

use crate::auth::AuthContext;
use crate::channel::{MessageChannel, SubscriptionHandle};
use crate::conversations::{
    ConversationStore, OutgoingMessage, RemoteOutcome, ThreadOutcome, ThreadTicket,
};
use crate::directory::Directory;
use crate::error::{MessagingError, ServiceError};
use crate::events::{ErrorScope, SessionEvent};
use crate::services::Backend;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the event queue. Events are dropped when the consumer
    /// falls this far behind.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { event_capacity: 64 }
    }
}

impl From<&crate::config::ClientConfig> for SessionConfig {
    fn from(config: &crate::config::ClientConfig) -> Self {
        Self {
            event_capacity: config.event_capacity,
        }
    }
}

/// Point-in-time copy of the session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub conversations: Vec<Conversation>,
    pub active_thread: Vec<Message>,
    pub selected: Option<Participant>,
    pub eligible: Vec<Participant>,
    pub initialized: bool,
    pub load_error: Option<MessagingError>,
    pub thread_error: Option<MessagingError>,
}

enum Command {
    Select(Participant),
    StartConversation {
        key: String,
        reply: oneshot::Sender<Result<Participant, MessagingError>>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<Result<Message, MessagingError>>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Completions fed back into the session task.
enum Input {
    Initialized {
        directory: Directory,
        history: Result<Vec<Message>, ServiceError>,
    },
    ThreadLoaded {
        ticket: ThreadTicket,
        result: Result<Vec<Message>, ServiceError>,
    },
    SendFinished {
        outgoing: OutgoingMessage,
        result: Result<Option<Message>, ServiceError>,
        reply: oneshot::Sender<Result<Message, MessagingError>>,
    },
    RemoteInsert(Message),
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Select a counterpart. The thread is fetched in the background and
    /// reported through [`SessionEvent::ThreadUpdated`].
    pub fn select(&self, participant: Participant) -> Result<(), MessagingError> {
        self.dispatch(Command::Select(participant))
    }

    /// Select a directory user by row id or uuid.
    pub async fn start_conversation(&self, key: &str) -> Result<Participant, MessagingError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::StartConversation {
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MessagingError::SessionClosed)?
    }

    /// Send `text` to the selected counterpart. Resolves once the message is
    /// persisted and reflected in the session state.
    pub async fn send(&self, text: &str) -> Result<Message, MessagingError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Send {
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MessagingError::SessionClosed)?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, MessagingError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Snapshot(reply))?;
        rx.await.map_err(|_| MessagingError::SessionClosed)
    }

    /// Stop the session and unsubscribe from the realtime channel.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn dispatch(&self, command: Command) -> Result<(), MessagingError> {
        self.commands
            .send(command)
            .map_err(|_| MessagingError::SessionClosed)
    }
}

/// Start a session for `current_user`.
///
/// The directory and history are loaded concurrently; realtime inserts are
/// subscribed to before the history request is issued. Must be called from
/// within a tokio runtime.
pub fn spawn_session<B, C>(
    backend: Arc<B>,
    channel: Arc<C>,
    current_user: Participant,
    config: SessionConfig,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>)
where
    B: Backend,
    C: MessageChannel,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

    let task = SessionTask {
        store: ConversationStore::new(current_user),
        backend,
        channel,
        inputs: input_tx,
        events: event_tx,
        subscription: None,
        initialized: false,
    };
    tokio::spawn(task.run(command_rx, input_rx));

    (
        SessionHandle {
            commands: command_tx,
        },
        event_rx,
    )
}

/// Start a session for whoever is signed in once auth has resolved.
pub async fn spawn_signed_in_session<B, C>(
    auth: &AuthContext,
    backend: Arc<B>,
    channel: Arc<C>,
    config: SessionConfig,
) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), MessagingError>
where
    B: Backend,
    C: MessageChannel,
{
    let user = auth
        .wait_until_loaded()
        .await?
        .user
        .ok_or(MessagingError::NotSignedIn)?;
    Ok(spawn_session(backend, channel, user, config))
}

struct SessionTask<B, C: MessageChannel> {
    store: ConversationStore,
    backend: Arc<B>,
    channel: Arc<C>,
    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::Sender<SessionEvent>,
    subscription: Option<SubscriptionHandle>,
    initialized: bool,
}

impl<B: Backend, C: MessageChannel> SessionTask<B, C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        let user = self.store.current_user().uuid.clone();
        info!(user = %user, "Messaging session started");

        self.subscribe();
        self.load_initial();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(input) = inputs.recv() => self.handle_input(input),
            }
        }

        if let Some(handle) = self.subscription.take() {
            self.channel.unsubscribe(&handle);
        }
        info!(user = %user, "Messaging session stopped");
    }

    fn subscribe(&mut self) {
        let inputs = self.inputs.clone();
        let on_insert = Box::new(move |message: Message| {
            let _ = inputs.send(Input::RemoteInsert(message));
        });
        match self.channel.subscribe(&self.store.current_user().uuid, on_insert) {
            Ok(handle) => self.subscription = Some(handle),
            Err(e) => {
                warn!(error = %e, "Realtime subscription failed, live updates disabled");
                self.emit(SessionEvent::error(ErrorScope::Channel, &e));
            }
        }
    }

    fn load_initial(&self) {
        let backend = self.backend.clone();
        let inputs = self.inputs.clone();
        let user = self.store.current_user().uuid.clone();

        tokio::spawn(async move {
            let (users, history) =
                tokio::join!(backend.list_users(), backend.query_by_participant(&user));
            let directory = match users {
                Ok(users) => Directory::new(users),
                Err(e) => {
                    warn!(error = %e, "User directory unavailable, using placeholder names");
                    Directory::default()
                }
            };
            let _ = inputs.send(Input::Initialized { directory, history });
        });
    }

    fn fetch_thread(&self, ticket: ThreadTicket) {
        let backend = self.backend.clone();
        let inputs = self.inputs.clone();

        tokio::spawn(async move {
            let result = backend
                .query_by_pair(&ticket.current_user, &ticket.counterpart.uuid)
                .await;
            let _ = inputs.send(Input::ThreadLoaded { ticket, result });
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Select(participant) => {
                let ticket = self.store.select_counterpart(participant);
                self.begin_thread(ticket);
            }
            Command::StartConversation { key, reply } => {
                let result = match self.store.start_conversation(&key) {
                    Some(ticket) => {
                        let counterpart = ticket.counterpart.clone();
                        self.begin_thread(ticket);
                        Ok(counterpart)
                    }
                    None => Err(MessagingError::UnknownUser(key)),
                };
                let _ = reply.send(result);
            }
            Command::Send { text, reply } => match self.store.prepare_send(&text) {
                Ok(outgoing) => self.persist(outgoing, reply),
                Err(e) => {
                    debug!(error = %e, "Send rejected");
                    let _ = reply.send(Err(e));
                }
            },
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn begin_thread(&mut self, ticket: ThreadTicket) {
        debug!(
            counterpart = %ticket.counterpart.uuid,
            generation = ticket.generation(),
            "Selected conversation"
        );
        self.emit(SessionEvent::conversations(&self.store));
        self.emit(SessionEvent::thread(&self.store));
        self.fetch_thread(ticket);
    }

    fn persist(
        &self,
        outgoing: OutgoingMessage,
        reply: oneshot::Sender<Result<Message, MessagingError>>,
    ) {
        let backend = self.backend.clone();
        let inputs = self.inputs.clone();

        tokio::spawn(async move {
            let result = backend
                .create(&outgoing.sender, &outgoing.receiver, &outgoing.body)
                .await;
            let _ = inputs.send(Input::SendFinished {
                outgoing,
                result,
                reply,
            });
        });
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Initialized { directory, history } => {
                self.initialized = true;
                match history {
                    Ok(history) => self.store.initialize(directory, history),
                    Err(e) => {
                        self.store.set_directory(directory);
                        self.store.fail_initialize(e.into());
                        if let Some(err) = self.store.load_error() {
                            self.emit(SessionEvent::error(ErrorScope::Load, err));
                        }
                    }
                }
                self.emit(SessionEvent::conversations(&self.store));
                if self.store.selected().is_some() {
                    self.emit(SessionEvent::thread(&self.store));
                }
            }

            Input::ThreadLoaded { ticket, result } => {
                match self.store.apply_thread(&ticket, result.map_err(Into::into)) {
                    ThreadOutcome::Applied => {
                        self.emit(SessionEvent::thread(&self.store));
                        self.emit(SessionEvent::conversations(&self.store));
                    }
                    ThreadOutcome::Failed => {
                        self.emit(SessionEvent::thread(&self.store));
                        if let Some(err) = self.store.thread_error() {
                            self.emit(SessionEvent::error(ErrorScope::Thread, err));
                        }
                    }
                    ThreadOutcome::Stale => {}
                }
            }

            Input::SendFinished {
                outgoing,
                result,
                reply,
            } => match result {
                Ok(echo) => {
                    let message = self.store.apply_sent(outgoing, echo);
                    self.emit(SessionEvent::thread(&self.store));
                    self.emit(SessionEvent::conversations(&self.store));
                    let _ = reply.send(Ok(message));
                }
                Err(e) => {
                    warn!(receiver = %outgoing.receiver, error = %e, "Send failed");
                    self.store.abandon_send(&outgoing);
                    self.emit(SessionEvent::error(ErrorScope::Send, &e));
                    let _ = reply.send(Err(e.into()));
                }
            },

            Input::RemoteInsert(message) => {
                debug!(msg_id = %message.id, "Realtime insert");
                if let RemoteOutcome::Applied { thread_changed } =
                    self.store.on_remote_insert(message)
                {
                    if thread_changed {
                        self.emit(SessionEvent::thread(&self.store));
                    }
                    self.emit(SessionEvent::conversations(&self.store));
                }
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversations: self.store.conversations().to_vec(),
            active_thread: self.store.active_thread().to_vec(),
            selected: self.store.selected().cloned(),
            eligible: self.store.eligible_counterparts(),
            initialized: self.initialized,
            load_error: self.store.load_error().cloned(),
            thread_error: self.store.thread_error().cloned(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = event.name(), "Session event queue full, dropping event");
            }
            // Nobody is listening.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use launchpad_shared::types::{MessageId, ParticipantId, Role};

    use super::*;
    use crate::channel::BroadcastChannel;
    use crate::mock::{Faults, MemoryBackend};

    fn person(uuid: &str, name: &str, role: Role) -> Participant {
        Participant {
            id: format!("row-{uuid}"),
            uuid: uuid.into(),
            display_name: name.into(),
            role: Some(role),
        }
    }

    fn me() -> Participant {
        person("U", "Una", Role::Founder)
    }

    fn alice() -> Participant {
        person("A", "Alice", Role::Investor)
    }

    fn bob() -> Participant {
        person("B", "Bob", Role::Founder)
    }

    fn backend() -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend::with_users(vec![me(), alice(), bob()]))
    }

    fn start(backend: &Arc<MemoryBackend>) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
        let channel = Arc::new(backend.channel());
        spawn_session(backend.clone(), channel, me(), SessionConfig::default())
    }

    /// Poll snapshots until `done` holds.
    async fn wait_until(
        handle: &SessionHandle,
        done: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let poll = async {
            loop {
                let snapshot = handle.snapshot().await.unwrap();
                if done(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), poll)
            .await
            .expect("session did not reach expected state")
    }

    fn thread_bodies(snapshot: &SessionSnapshot) -> Vec<&str> {
        snapshot.active_thread.iter().map(|m| m.body.as_str()).collect()
    }

    #[tokio::test]
    async fn loads_conversations_with_directory_names() {
        let backend = backend();
        backend.insert_remote("A", "U", "hello").unwrap();
        backend.insert_remote("U", "B", "hey bob").unwrap();

        let (handle, _events) = start(&backend);
        let snapshot = wait_until(&handle, |s| s.initialized).await;

        let names: Vec<_> = snapshot
            .conversations
            .iter()
            .map(|c| c.counterpart.display_name.as_str())
            .collect();
        assert_eq!(names, vec!["Bob", "Alice"]);
        assert_eq!(snapshot.eligible.len(), 2);
    }

    #[tokio::test]
    async fn directory_failure_falls_back_to_placeholders() {
        let backend = backend();
        backend.set_faults(Faults {
            directory: true,
            ..Faults::default()
        });
        backend.insert_remote("A", "U", "hello").unwrap();

        let (handle, _events) = start(&backend);
        let snapshot = wait_until(&handle, |s| s.initialized).await;

        assert_eq!(snapshot.conversations[0].counterpart.display_name, "User A");
        assert_eq!(snapshot.load_error, None);
    }

    #[tokio::test]
    async fn history_failure_sets_load_error_and_emits_event() {
        let backend = backend();
        backend.set_faults(Faults {
            history: true,
            ..Faults::default()
        });

        let (handle, mut events) = start(&backend);
        let snapshot = wait_until(&handle, |s| s.initialized).await;

        assert!(snapshot.conversations.is_empty());
        assert!(matches!(snapshot.load_error, Some(MessagingError::Service(_))));

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::MessagingError { scope, .. } = event {
                saw_error |= scope == ErrorScope::Load;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn send_and_echo_produce_one_thread_entry() {
        let backend = backend();
        let (handle, _events) = start(&backend);
        wait_until(&handle, |s| s.initialized).await;

        handle.select(alice()).unwrap();
        wait_until(&handle, |s| s.selected.is_some()).await;
        let sent = handle.send("hi").await.unwrap();
        assert!(matches!(sent.id, MessageId::Row(_)));

        // Let the echo from the realtime feed arrive.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = handle.snapshot().await.unwrap();

        assert_eq!(snapshot.active_thread, vec![sent.clone()]);
        assert_eq!(snapshot.conversations.len(), 1);
        assert_eq!(snapshot.conversations[0].last_message, Some(sent));
    }

    #[tokio::test]
    async fn send_without_echo_is_replaced_by_feed_copy() {
        let backend = backend();
        backend.set_echo_creates(false);
        let (handle, _events) = start(&backend);
        wait_until(&handle, |s| s.initialized).await;

        handle.select(alice()).unwrap();
        let sent = handle.send("hi").await.unwrap();

        let snapshot = wait_until(&handle, |s| {
            s.active_thread.len() == 1 && !s.active_thread[0].is_optimistic()
        })
        .await;
        assert_eq!(thread_bodies(&snapshot), vec!["hi"]);
        assert_eq!(snapshot.active_thread[0].sender_id, sent.sender_id);
        assert!(!snapshot.conversations[0]
            .last_message
            .as_ref()
            .unwrap()
            .is_optimistic());
    }

    #[tokio::test]
    async fn failed_send_leaves_state_untouched() {
        let backend = backend();
        backend.insert_remote("A", "U", "hello").unwrap();
        let (handle, _events) = start(&backend);
        handle.select(alice()).unwrap();
        let before = wait_until(&handle, |s| s.initialized && s.active_thread.len() == 1).await;

        backend.set_faults(Faults {
            create: true,
            ..Faults::default()
        });
        let err = handle.send("will fail").await.unwrap_err();
        assert!(matches!(err, MessagingError::Service(ServiceError::Backend(_))));

        let after = handle.snapshot().await.unwrap();
        assert_eq!(after.active_thread, before.active_thread);
        assert_eq!(after.conversations, before.conversations);
    }

    #[tokio::test]
    async fn invalid_sends_are_rejected_before_io() {
        let backend = backend();
        let (handle, _events) = start(&backend);
        wait_until(&handle, |s| s.initialized).await;

        assert_eq!(handle.send("hi").await, Err(MessagingError::NoCounterpart));
        handle.select(alice()).unwrap();
        assert_eq!(handle.send("   ").await, Err(MessagingError::EmptyMessage));
        assert!(backend.messages().is_empty());
    }

    #[tokio::test]
    async fn stale_thread_fetch_is_discarded() {
        let backend = backend();
        backend.insert_remote("A", "U", "from alice").unwrap();
        backend.insert_remote("B", "U", "from bob").unwrap();
        backend.set_thread_delay("A", Duration::from_millis(100));

        let (handle, _events) = start(&backend);
        wait_until(&handle, |s| s.initialized).await;

        handle.select(alice()).unwrap();
        handle.select(bob()).unwrap();
        wait_until(&handle, |s| s.active_thread.len() == 1).await;

        // Alice's slow fetch completes after Bob's.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.selected.as_ref().unwrap().uuid, ParticipantId::from("B"));
        assert_eq!(thread_bodies(&snapshot), vec!["from bob"]);
    }

    #[tokio::test]
    async fn insert_for_other_counterpart_updates_list_only() {
        let backend = backend();
        backend.insert_remote("A", "U", "from alice").unwrap();
        let (handle, _events) = start(&backend);
        handle.select(alice()).unwrap();
        wait_until(&handle, |s| s.initialized && s.active_thread.len() == 1).await;

        backend.insert_remote("B", "U", "from bob").unwrap();
        let snapshot = wait_until(&handle, |s| s.conversations.len() == 2).await;

        assert_eq!(snapshot.conversations[0].counterpart.display_name, "Bob");
        assert_eq!(thread_bodies(&snapshot), vec!["from alice"]);
    }

    #[tokio::test]
    async fn out_of_order_inserts_keep_newest_preview() {
        let backend = backend();
        let (handle, _events) = start(&backend);
        handle.select(alice()).unwrap();
        wait_until(&handle, |s| s.initialized && s.selected.is_some()).await;

        let newer = Utc.timestamp_opt(2_000, 0).unwrap();
        let older = Utc.timestamp_opt(1_000, 0).unwrap();
        backend.insert_at(&"A".into(), &"U".into(), "newer", newer).unwrap();
        backend.insert_at(&"A".into(), &"U".into(), "older", older).unwrap();

        let snapshot = wait_until(&handle, |s| s.active_thread.len() == 2).await;
        assert_eq!(thread_bodies(&snapshot), vec!["older", "newer"]);
        assert_eq!(
            snapshot.conversations[0].last_message.as_ref().unwrap().body,
            "newer"
        );
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_deduplicated() {
        let backend = backend();
        let (handle, _events) = start(&backend);
        handle.select(alice()).unwrap();
        wait_until(&handle, |s| s.initialized && s.selected.is_some()).await;

        let message = backend.insert_remote("A", "U", "once").unwrap();
        backend.publish(message.clone());
        backend.publish(message);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(thread_bodies(&snapshot), vec!["once"]);
        assert_eq!(snapshot.conversations.len(), 1);
    }

    #[tokio::test]
    async fn start_conversation_by_directory_key() {
        let backend = backend();
        let (handle, _events) = start(&backend);
        wait_until(&handle, |s| s.initialized).await;

        let bob = handle.start_conversation("row-B").await.unwrap();
        assert_eq!(bob.display_name, "Bob");
        assert!(matches!(
            handle.start_conversation("nobody").await,
            Err(MessagingError::UnknownUser(_))
        ));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.conversations[0].counterpart.uuid, bob.uuid);
        assert!(snapshot.conversations[0].last_message.is_none());
    }

    #[tokio::test]
    async fn shutdown_unsubscribes() {
        let backend = backend();
        let (handle, _events) = start(&backend);
        wait_until(&handle, |s| s.initialized).await;
        assert_eq!(backend.subscriber_count(), 1);

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.subscriber_count(), 0);
        assert_eq!(handle.snapshot().await, Err(MessagingError::SessionClosed));
    }

    #[tokio::test]
    async fn signed_in_session_requires_user() {
        let backend = backend();
        let (auth, _sub) = AuthContext::connect(backend.clone()).unwrap();
        let channel = Arc::new(BroadcastChannel::new(tokio::sync::broadcast::channel(4).0));

        let res = spawn_signed_in_session(
            &auth,
            backend.clone(),
            channel.clone(),
            SessionConfig::default(),
        )
        .await;
        assert!(matches!(res, Err(MessagingError::NotSignedIn)));

        backend.sign_in(Some(me()));
        let (handle, _events) =
            spawn_signed_in_session(&auth, backend, channel, SessionConfig::default())
                .await
                .unwrap();
        let snapshot = wait_until(&handle, |s| s.initialized).await;
        assert!(snapshot.conversations.is_empty());
    }
}
