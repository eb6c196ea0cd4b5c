//! Auth state shared with the rest of the client.
//!
//! [`AuthContext`] owns the single auth-state subscription of the process and
//! republishes it as an [`AuthState`] on a `watch` channel. Components take a
//! clone of the context instead of subscribing themselves.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use launchpad_shared::types::{Participant, Role};

use crate::channel::{spawn_delivery, SubscriptionHandle};
use crate::error::{MessagingError, ServiceError};
use crate::services::AuthProvider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthState {
    pub user: Option<Participant>,
    pub role: Option<Role>,
    /// `true` until the provider has resolved the session once.
    pub loading: bool,
}

impl AuthState {
    fn loading() -> Self {
        Self {
            user: None,
            role: None,
            loading: true,
        }
    }

    fn resolved(user: Option<Participant>) -> Self {
        Self {
            role: user.as_ref().and_then(|u| u.role),
            user,
            loading: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    state: watch::Receiver<AuthState>,
}

impl AuthContext {
    /// Subscribe to `provider` and resolve the current session in the
    /// background.
    ///
    /// The returned handle ends the subscription. Requires a tokio runtime.
    pub fn connect<P: AuthProvider>(
        provider: Arc<P>,
    ) -> Result<(Self, SubscriptionHandle), ServiceError> {
        let (tx, rx) = watch::channel(AuthState::loading());
        let tx = Arc::new(tx);

        let listener = tx.clone();
        let handle = provider.on_auth_state_change(Box::new(move |user| {
            debug!(signed_in = user.is_some(), "Auth state changed");
            listener.send_replace(AuthState::resolved(user));
        }));

        let initial = spawn_delivery(async move {
            let user = match provider.current_user().await {
                Ok(user) => user,
                Err(e) => {
                    warn!(error = %e, "Failed to resolve current user");
                    None
                }
            };
            // A change notification may already have resolved the state.
            tx.send_if_modified(|state| {
                if state.loading {
                    *state = AuthState::resolved(user);
                    true
                } else {
                    false
                }
            });
        });
        if let Err(e) = initial {
            handle.close();
            return Err(e);
        }

        Ok((Self { state: rx }, handle))
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.state.borrow().role
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn current_user(&self) -> Option<Participant> {
        self.state.borrow().user.clone()
    }

    /// Wait for the first resolution and return the state at that point.
    pub async fn wait_until_loaded(&self) -> Result<AuthState, MessagingError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| !s.loading)
            .await
            .map_err(|_| MessagingError::SessionClosed)?;
        Ok(state.clone())
    }

    /// Receiver notified on every auth change.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryBackend;

    fn founder() -> Participant {
        Participant {
            id: "1".into(),
            uuid: "U".into(),
            display_name: "Una".into(),
            role: Some(Role::Founder),
        }
    }

    #[tokio::test]
    async fn resolves_current_user_once_loaded() {
        let backend = Arc::new(MemoryBackend::new());
        backend.sign_in(Some(founder()));

        let (auth, _handle) = AuthContext::connect(backend).unwrap();
        let state = auth.wait_until_loaded().await.unwrap();

        assert!(!state.loading);
        assert_eq!(state.role, Some(Role::Founder));
        assert_eq!(auth.current_user().unwrap().uuid.as_str(), "U");
    }

    #[tokio::test]
    async fn follows_sign_in_and_sign_out() {
        let backend = Arc::new(MemoryBackend::new());
        let (auth, handle) = AuthContext::connect(backend.clone()).unwrap();
        auth.wait_until_loaded().await.unwrap();
        assert_eq!(auth.current_user(), None);

        let mut changes = auth.subscribe();
        backend.sign_in(Some(founder()));
        changes.changed().await.unwrap();
        assert_eq!(auth.role(), Some(Role::Founder));

        backend.sign_in(None);
        assert_eq!(auth.role(), None);
        assert!(!auth.is_loading());

        handle.close();
        backend.sign_in(Some(founder()));
        assert_eq!(auth.current_user(), None);
    }

    #[test]
    fn connect_without_runtime_fails() {
        let backend = Arc::new(MemoryBackend::new());
        assert!(AuthContext::connect(backend).is_err());
    }
}
