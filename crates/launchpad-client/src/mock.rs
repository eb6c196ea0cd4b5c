//! In-memory backend for tests and demos.
//!
//! [`MemoryBackend`] implements every service trait over a shared message
//! log and publishes each insert on a `broadcast` feed that
//! [`MemoryBackend::channel`] turns into a [`BroadcastChannel`]. Failures and
//! per-counterpart latency can be injected to exercise error paths and
//! out-of-order completions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use launchpad_shared::constants::DEFAULT_FEED_CAPACITY;
use launchpad_shared::error::RowError;
use launchpad_shared::rows::validate_body;
use launchpad_shared::types::{Message, MessageId, Participant, ParticipantId};

use crate::channel::{BroadcastChannel, SubscriptionHandle};
use crate::error::ServiceError;
use crate::services::{AuthCallback, AuthProvider, MessageService, UserDirectory};

/// Injected failures. Each flag makes the matching call return
/// [`ServiceError::Backend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub directory: bool,
    pub history: bool,
    pub thread: bool,
    pub create: bool,
}

struct Inner {
    users: Vec<Participant>,
    messages: Vec<Message>,
    next_id: i64,
    faults: Faults,
    echo_creates: bool,
    thread_delays: HashMap<ParticipantId, Duration>,
    current_user: Option<Participant>,
}

type AuthListeners = Arc<Mutex<Vec<(u64, Arc<AuthCallback>)>>>;

pub struct MemoryBackend {
    inner: Mutex<Inner>,
    feed: broadcast::Sender<Message>,
    auth_listeners: AuthListeners,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(DEFAULT_FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                users: Vec::new(),
                messages: Vec::new(),
                next_id: 1,
                faults: Faults::default(),
                echo_creates: true,
                thread_delays: HashMap::new(),
                current_user: None,
            }),
            feed,
            auth_listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_users(users: Vec<Participant>) -> Self {
        let backend = Self::new();
        lock(&backend.inner).users = users;
        backend
    }

    pub fn add_user(&self, user: Participant) {
        lock(&self.inner).users.push(user);
    }

    pub fn set_faults(&self, faults: Faults) {
        lock(&self.inner).faults = faults;
    }

    /// Whether `create` returns the inserted row. The feed always carries it.
    pub fn set_echo_creates(&self, echo: bool) {
        lock(&self.inner).echo_creates = echo;
    }

    /// Delay pair queries involving `counterpart`.
    pub fn set_thread_delay(&self, counterpart: impl Into<ParticipantId>, delay: Duration) {
        lock(&self.inner)
            .thread_delays
            .insert(counterpart.into(), delay);
    }

    /// Realtime transport over this backend's insert feed.
    pub fn channel(&self) -> BroadcastChannel {
        BroadcastChannel::new(self.feed.clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner).messages.clone()
    }

    /// Insert a message as if another client had sent it.
    pub fn insert_remote(
        &self,
        sender: impl Into<ParticipantId>,
        receiver: impl Into<ParticipantId>,
        body: &str,
    ) -> Result<Message, ServiceError> {
        self.insert_at(&sender.into(), &receiver.into(), body, Utc::now())
    }

    /// Insert with an explicit timestamp, for out-of-order delivery.
    pub fn insert_at(
        &self,
        sender: &ParticipantId,
        receiver: &ParticipantId,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message, ServiceError> {
        if sender == receiver {
            return Err(RowError::SelfAddressed(sender.to_string()).into());
        }
        validate_body(body)?;

        let message = {
            let mut inner = lock(&self.inner);
            let message = Message {
                id: MessageId::Row(inner.next_id),
                sender_id: sender.clone(),
                receiver_id: receiver.clone(),
                body: body.to_string(),
                created_at: created_at.trunc_subsecs(6),
            };
            inner.next_id += 1;
            inner.messages.push(message.clone());
            message
        };
        self.publish(message.clone());
        Ok(message)
    }

    /// Deliver `message` on the feed without storing it.
    pub fn publish(&self, message: Message) {
        // No subscribers is fine.
        let _ = self.feed.send(message);
    }

    /// Change the signed-in user and notify auth listeners.
    pub fn sign_in(&self, user: Option<Participant>) {
        lock(&self.inner).current_user = user.clone();
        let listeners: Vec<Arc<AuthCallback>> = lock(&self.auth_listeners)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for listener in listeners {
            listener(user.clone());
        }
    }
}

impl MessageService for MemoryBackend {
    async fn create(
        &self,
        sender: &ParticipantId,
        receiver: &ParticipantId,
        body: &str,
    ) -> Result<Option<Message>, ServiceError> {
        let (fail, echo) = {
            let inner = lock(&self.inner);
            (inner.faults.create, inner.echo_creates)
        };
        if fail {
            return Err(ServiceError::Backend("create failed".into()));
        }
        let message = self.insert_at(sender, receiver, body, Utc::now())?;
        debug!(msg_id = %message.id, echo, "Memory backend stored message");
        Ok(echo.then_some(message))
    }

    async fn query_by_participant(
        &self,
        user: &ParticipantId,
    ) -> Result<Vec<Message>, ServiceError> {
        let inner = lock(&self.inner);
        if inner.faults.history {
            return Err(ServiceError::Backend("history query failed".into()));
        }
        let mut found: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.involves(user))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn query_by_pair(
        &self,
        a: &ParticipantId,
        b: &ParticipantId,
    ) -> Result<Vec<Message>, ServiceError> {
        let delay = {
            let inner = lock(&self.inner);
            inner
                .thread_delays
                .get(a)
                .or_else(|| inner.thread_delays.get(b))
                .copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = lock(&self.inner);
        if inner.faults.thread {
            return Err(ServiceError::Backend("thread query failed".into()));
        }
        let mut found: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect();
        found.sort_by_key(|m| m.created_at);
        Ok(found)
    }
}

impl UserDirectory for MemoryBackend {
    async fn list_users(&self) -> Result<Vec<Participant>, ServiceError> {
        let inner = lock(&self.inner);
        if inner.faults.directory {
            return Err(ServiceError::Backend("directory unavailable".into()));
        }
        Ok(inner.users.clone())
    }
}

impl AuthProvider for MemoryBackend {
    async fn current_user(&self) -> Result<Option<Participant>, ServiceError> {
        Ok(lock(&self.inner).current_user.clone())
    }

    fn on_auth_state_change(&self, callback: AuthCallback) -> SubscriptionHandle {
        let listeners = self.auth_listeners.clone();
        let id = {
            let mut guard = lock(&listeners);
            let id = guard.last().map_or(1, |(id, _)| id + 1);
            guard.push((id, Arc::new(callback)));
            id
        };
        SubscriptionHandle::with_cleanup(move || {
            lock(&listeners).retain(|(listener, _)| *listener != id);
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::channel::MessageChannel;

    #[tokio::test]
    async fn create_stores_and_broadcasts() {
        let backend = MemoryBackend::new();
        let mut feed = backend.feed.subscribe();

        let echo = backend
            .create(&"U".into(), &"A".into(), "hi")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(feed.recv().await.unwrap(), echo);
        assert_eq!(backend.messages(), vec![echo]);
    }

    #[tokio::test]
    async fn create_without_echo_still_publishes() {
        let backend = MemoryBackend::new();
        backend.set_echo_creates(false);
        let mut feed = backend.feed.subscribe();

        let echo = backend.create(&"U".into(), &"A".into(), "hi").await.unwrap();

        assert!(echo.is_none());
        assert_eq!(feed.recv().await.unwrap().body, "hi");
    }

    #[tokio::test]
    async fn faults_fail_the_matching_call() {
        let backend = MemoryBackend::new();
        backend.set_faults(Faults {
            thread: true,
            ..Faults::default()
        });

        assert!(backend.query_by_participant(&"U".into()).await.is_ok());
        assert!(matches!(
            backend.query_by_pair(&"U".into(), &"A".into()).await,
            Err(ServiceError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn pair_query_is_ascending() {
        let backend = MemoryBackend::new();
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(5);
        backend.insert_at(&"A".into(), &"U".into(), "later", later).unwrap();
        backend.insert_at(&"U".into(), &"A".into(), "earlier", earlier).unwrap();
        backend.insert_at(&"U".into(), &"B".into(), "elsewhere", later).unwrap();

        let thread = backend.query_by_pair(&"U".into(), &"A".into()).await.unwrap();
        let bodies: Vec<_> = thread.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["earlier", "later"]);
    }

    #[tokio::test]
    async fn auth_listeners_are_removed_on_close() {
        let backend = MemoryBackend::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handle = backend.on_auth_state_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        backend.sign_in(Some(Participant::placeholder("U")));
        handle.close();
        backend.sign_in(None);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.current_user().await.unwrap(), None);
    }

    #[tokio::test]
    async fn channel_delivers_remote_inserts() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let channel = backend.channel();
        let handle = channel
            .subscribe(
                &"U".into(),
                Box::new(move |m| {
                    let _ = tx.send(m);
                }),
            )
            .unwrap();

        let sent = backend.insert_remote("A", "U", "ping").unwrap();
        assert_eq!(rx.recv().await.unwrap(), sent);
        channel.unsubscribe(&handle);
    }
}
