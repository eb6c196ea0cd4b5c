//! Realtime insert feed.
//!
//! A [`MessageChannel`] delivers every newly created message involving a
//! user, in the order the backend observes them. Duplicates (for instance the
//! echo of a message this client just sent) are delivered as-is; the
//! [`ConversationStore`](crate::conversations::ConversationStore) dedups them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use launchpad_shared::types::{Message, ParticipantId};

use crate::error::ServiceError;

/// Callback invoked for every delivered insert.
pub type InsertCallback = Box<dyn Fn(Message) + Send + Sync + 'static>;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an active subscription.
///
/// Closing is idempotent. Dropping the handle does not stop delivery; call
/// [`SubscriptionHandle::close`] or [`MessageChannel::unsubscribe`].
pub struct SubscriptionHandle {
    id: u64,
    closed: AtomicBool,
    cleanup: Mutex<Option<Cleanup>>,
}

impl SubscriptionHandle {
    /// Handle that runs `cleanup` once, on the first close.
    pub fn with_cleanup(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
            cleanup: Mutex::new(Some(Box::new(cleanup))),
        }
    }

    /// Handle that aborts the delivery task on close.
    pub fn for_task(task: JoinHandle<()>) -> Self {
        let abort = task.abort_handle();
        Self::with_cleanup(move || abort.abort())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop delivery. Returns `true` only for the call that actually closed
    /// the subscription.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        debug!(subscription = self.id, "Subscription closed");
        true
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Live-update transport consumed by the messaging session.
pub trait MessageChannel: Send + Sync + 'static {
    /// Begin delivering every new message where `user` is sender or receiver.
    fn subscribe(
        &self,
        user: &ParticipantId,
        on_insert: InsertCallback,
    ) -> Result<SubscriptionHandle, ServiceError>;

    /// Stop delivery. Safe to call repeatedly and on closed handles.
    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.close();
    }
}

/// Spawn on the ambient tokio runtime, reporting a missing runtime as an
/// error instead of panicking.
pub(crate) fn spawn_delivery<F>(task: F) -> Result<JoinHandle<()>, ServiceError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| ServiceError::Backend(format!("No tokio runtime: {e}")))?;
    Ok(runtime.spawn(task))
}

/// Channel over an in-process `broadcast` feed of inserted messages.
#[derive(Clone)]
pub struct BroadcastChannel {
    feed: broadcast::Sender<Message>,
}

impl BroadcastChannel {
    pub fn new(feed: broadcast::Sender<Message>) -> Self {
        Self { feed }
    }
}

impl MessageChannel for BroadcastChannel {
    fn subscribe(
        &self,
        user: &ParticipantId,
        on_insert: InsertCallback,
    ) -> Result<SubscriptionHandle, ServiceError> {
        let mut rx = self.feed.subscribe();
        let user = user.clone();

        let task = spawn_delivery(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if message.involves(&user) {
                            on_insert(message);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(user = %user, skipped, "Realtime feed lagged, inserts dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(user = %user, "Realtime feed closed");
                        break;
                    }
                }
            }
        })?;

        debug!("Subscribed to in-process realtime feed");
        Ok(SubscriptionHandle::for_task(task))
    }
}
