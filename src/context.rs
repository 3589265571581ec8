// Execution context: what a transport is allowed to do when a session dies

use std::sync::Arc;
use tokio::sync::watch;

use crate::auth::{CredentialStore, Identity};
use crate::broadcast::{BroadcastEvent, SessionChannel};

/// Views the session layer navigates between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Unauthenticated landing view
    Guest,
    /// Authenticated landing view
    Dashboard,
}

impl Route {
    pub fn path(&self) -> &'static str {
        match self {
            Route::Guest => "/",
            Route::Dashboard => "/dashboard",
        }
    }
}

/// Client-side navigation capability
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: Route);
}

/// Navigator for headless tabs: records the move in the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, route: Route) {
        tracing::info!(path = route.path(), "Navigating");
    }
}

/// Capabilities of a browser tab
///
/// Clones share the same identity cell, navigator and channel.
#[derive(Clone)]
pub struct ClientContext {
    store: CredentialStore,
    navigator: Arc<dyn Navigator>,
    channel: Arc<dyn SessionChannel>,
    identity: Arc<watch::Sender<Option<Identity>>>,
}

impl ClientContext {
    pub fn new(
        store: CredentialStore,
        navigator: Arc<dyn Navigator>,
        channel: Arc<dyn SessionChannel>,
    ) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            store,
            navigator,
            channel,
            identity: Arc::new(identity),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn navigator(&self) -> &Arc<dyn Navigator> {
        &self.navigator
    }

    pub fn channel(&self) -> &Arc<dyn SessionChannel> {
        &self.channel
    }

    pub fn identity(&self) -> &watch::Sender<Option<Identity>> {
        &self.identity
    }

    /// Global sign-out
    ///
    /// Clears the stored tokens and the in-memory identity, navigates to the
    /// guest view and tells the other tabs. Calling it again with nothing
    /// left to clear only navigates.
    pub fn sign_out(&self) {
        let had_tokens = match self.store.get() {
            Ok(pair) => pair.is_some(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read credentials during sign-out");
                true
            }
        };

        if let Err(e) = self.store.clear() {
            tracing::error!(error = %e, "Failed to clear credentials during sign-out");
        }

        let had_identity = self.identity.send_replace(None).is_some();

        self.navigator.navigate(Route::Guest);

        if had_tokens || had_identity {
            tracing::info!("Signed out");
            self.channel.announce(BroadcastEvent::SignedOut);
        } else {
            tracing::debug!("Sign-out with no active session");
        }
    }
}

/// Where a transport runs
#[derive(Clone)]
pub enum ExecutionContext {
    /// Browser tab: may sign out, navigate and broadcast
    Client(ClientContext),
    /// Server render: no client storage or navigation; auth failures surface
    /// as [`SessionError::AuthToken`](crate::error::SessionError::AuthToken)
    Server,
}

impl ExecutionContext {
    pub fn is_client(&self) -> bool {
        matches!(self, ExecutionContext::Client(_))
    }

    pub fn client(&self) -> Option<&ClientContext> {
        match self {
            ExecutionContext::Client(ctx) => Some(ctx),
            ExecutionContext::Server => None,
        }
    }
}
