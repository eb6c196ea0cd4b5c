//! External collaborators consumed by the messaging core.
//!
//! Each trait is an opaque service: wire format and storage schema belong to
//! the implementation ([`crate::http::HttpBackend`] for the REST server, the
//! in-memory backend for tests).

use std::future::Future;

use launchpad_shared::types::{Message, Participant, ParticipantId};

use crate::channel::SubscriptionHandle;
use crate::error::ServiceError;

/// Persistent message store.
pub trait MessageService: Send + Sync + 'static {
    /// Persist a new message. The store may not echo the inserted row, in
    /// which case `Ok(None)` is returned.
    fn create(
        &self,
        sender: &ParticipantId,
        receiver: &ParticipantId,
        body: &str,
    ) -> impl Future<Output = Result<Option<Message>, ServiceError>> + Send;

    /// Every message where `user` is sender or receiver.
    fn query_by_participant(
        &self,
        user: &ParticipantId,
    ) -> impl Future<Output = Result<Vec<Message>, ServiceError>> + Send;

    /// The thread between `a` and `b`, ascending by `created_at`.
    fn query_by_pair(
        &self,
        a: &ParticipantId,
        b: &ParticipantId,
    ) -> impl Future<Output = Result<Vec<Message>, ServiceError>> + Send;
}

/// User directory used for display-name resolution.
pub trait UserDirectory: Send + Sync + 'static {
    fn list_users(&self) -> impl Future<Output = Result<Vec<Participant>, ServiceError>> + Send;
}

/// Callback invoked on every sign-in / sign-out.
pub type AuthCallback = Box<dyn Fn(Option<Participant>) + Send + Sync + 'static>;

/// Authentication provider.
pub trait AuthProvider: Send + Sync + 'static {
    fn current_user(
        &self,
    ) -> impl Future<Output = Result<Option<Participant>, ServiceError>> + Send;

    fn on_auth_state_change(&self, callback: AuthCallback) -> SubscriptionHandle;
}

/// Everything a messaging session needs from the backend.
pub trait Backend: MessageService + UserDirectory {}

impl<T: MessageService + UserDirectory> Backend for T {}
