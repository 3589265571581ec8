//! Session state for one tab.
//!
//! [`SessionProvider`] owns the signed-in identity, drives sign-in and
//! sign-out through the authenticated transport and reacts to session
//! changes announced by sibling tabs.

use std::sync::{Arc, Once};
use tokio::sync::watch;

use crate::auth::{Identity, Requirements, SessionResponse, SignInCredentials, TokenPair};
use crate::broadcast::BroadcastEvent;
use crate::context::{ClientContext, ExecutionContext, Route};
use crate::error::{Result, SessionError};
use crate::http_client::ApiClient;

/// Sign-in endpoint
pub const SESSIONS_PATH: &str = "/sessions";

/// Self-lookup endpoint
pub const ME_PATH: &str = "/me";

/// Session provider for one tab
#[derive(Clone)]
pub struct SessionProvider {
    client: ApiClient,
    context: ClientContext,
    /// Sibling-tab subscription, made on the first `start`
    subscribed: Arc<Once>,
}

impl SessionProvider {
    /// Wrap a client-context transport
    pub fn new(client: ApiClient) -> Result<Self> {
        let context = match client.context() {
            ExecutionContext::Client(ctx) => ctx.clone(),
            ExecutionContext::Server => {
                return Err(SessionError::Internal(anyhow::anyhow!(
                    "Session provider needs a client context"
                )))
            }
        };

        Ok(Self {
            client,
            context,
            subscribed: Arc::new(Once::new()),
        })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Subscribe to sibling tabs, then restore a persisted session
    ///
    /// Calling it again only restores; the subscription is made once per
    /// provider and its clones.
    pub async fn start(&self) {
        self.subscribed.call_once(|| {
            let provider = self.clone();
            self.context
                .channel()
                .on_event(Box::new(move |event| provider.handle_event(event)));
        });

        self.restore().await;
    }

    /// Restore the session from the persisted access token
    ///
    /// Any failure that reaches this point (expired tokens were already
    /// retried by the transport) signs the tab out.
    pub async fn restore(&self) {
        let token = match self.context.store().access_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::debug!("No persisted session");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read persisted session");
                return;
            }
        };

        self.client.set_default_token(Some(token));

        match self.client.get_json::<Identity>(ME_PATH).await {
            Ok(identity) => {
                tracing::info!(email = %identity.email, "Session restored");
                self.context.identity().send_replace(Some(identity));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Self-lookup failed, signing out");
                self.sign_out();
            }
        }
    }

    /// Exchange credentials for a session
    ///
    /// Failures are logged and swallowed; callers observe the outcome
    /// through [`is_authenticated`](Self::is_authenticated).
    pub async fn sign_in(&self, credentials: SignInCredentials) {
        if let Err(e) = self.try_sign_in(&credentials).await {
            tracing::error!(email = %credentials.email, error = %e, "Sign in error");
        }
    }

    async fn try_sign_in(&self, credentials: &SignInCredentials) -> Result<()> {
        let response: SessionResponse = self.client.post_json(SESSIONS_PATH, credentials).await?;

        let pair = TokenPair {
            access_token: response.token,
            refresh_token: response.refresh_token,
        };
        self.context.store().set(&pair)?;

        self.context.identity().send_replace(Some(Identity {
            email: credentials.email.clone(),
            permissions: response.permissions,
            roles: response.roles,
        }));

        self.client.replace_session(Some(pair.access_token));

        tracing::info!(email = %credentials.email, "Signed in");
        self.context.navigator().navigate(Route::Dashboard);
        self.context.channel().announce(BroadcastEvent::SignedIn);

        Ok(())
    }

    /// Sign out this tab and tell the others; safe to call repeatedly
    pub fn sign_out(&self) {
        self.context.sign_out();
        self.client.replace_session(None);
    }

    pub fn is_authenticated(&self) -> bool {
        self.context.identity().borrow().is_some()
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.context.identity().borrow().clone()
    }

    /// Observe identity changes
    pub fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.context.identity().subscribe()
    }

    /// Whether the signed-in user meets `requirements`
    pub fn can(&self, requirements: &Requirements) -> bool {
        match self.context.identity().borrow().as_ref() {
            Some(identity) => requirements.is_satisfied_by_identity(identity),
            None => false,
        }
    }

    fn handle_event(&self, event: BroadcastEvent) {
        tracing::debug!(event = event.as_str(), "Session event from another tab");

        match event {
            BroadcastEvent::SignedOut => {
                self.context.identity().send_replace(None);
                self.client.replace_session(None);
                self.context.navigator().navigate(Route::Guest);
            }
            BroadcastEvent::SignedIn => {
                self.context.navigator().navigate(Route::Dashboard);
                let provider = self.clone();
                tokio::spawn(async move { provider.restore().await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialStore, HttpRenewer};
    use crate::broadcast::BroadcastHub;
    use crate::context::LogNavigator;
    use std::sync::Arc;

    fn provider(base_url: &str) -> SessionProvider {
        let store = CredentialStore::in_memory();
        let hub = BroadcastHub::new();
        let ctx = ClientContext::new(store.clone(), Arc::new(LogNavigator), Arc::new(hub.open_session()));
        let client = ApiClient::from_parts(
            reqwest::Client::new(),
            base_url,
            store,
            ExecutionContext::Client(ctx),
            Arc::new(HttpRenewer::new(reqwest::Client::new(), base_url)),
        );
        SessionProvider::new(client).unwrap()
    }

    #[test]
    fn test_requires_client_context() {
        let client = ApiClient::from_parts(
            reqwest::Client::new(),
            "http://localhost:3333",
            CredentialStore::in_memory(),
            ExecutionContext::Server,
            Arc::new(HttpRenewer::new(reqwest::Client::new(), "http://localhost:3333")),
        );
        assert!(SessionProvider::new(client).is_err());
    }

    #[tokio::test]
    async fn test_signed_out_by_default() {
        let session = provider("http://localhost:3333");
        assert!(!session.is_authenticated());
        assert!(session.current_user().is_none());
        assert!(!session.can(&Requirements::new()));
    }

    #[tokio::test]
    async fn test_sign_in_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sessions")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let session = provider(&server.url());
        session
            .sign_in(SignInCredentials::new("a@b.c", "wrong"))
            .await;

        assert!(!session.is_authenticated());
        assert_eq!(session.client().store().get().unwrap(), None);
    }

    #[tokio::test]
    async fn test_sign_in_and_can() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sessions")
            .with_status(200)
            .with_body(
                r#"{"token":"T1","refreshToken":"R1","permissions":["metrics.list"],"roles":["editor"]}"#,
            )
            .create_async()
            .await;

        let session = provider(&server.url());
        let mut watcher = session.watch();
        session
            .sign_in(SignInCredentials::new("a@b.c", "secret"))
            .await;

        assert!(session.is_authenticated());
        assert!(watcher.has_changed().unwrap());
        assert_eq!(
            watcher.borrow_and_update().as_ref().map(|i| i.email.clone()),
            Some("a@b.c".to_string())
        );
        assert_eq!(session.client().default_token().as_deref(), Some("T1"));
        assert!(session.can(&Requirements::new().permission("metrics.list")));
        assert!(!session.can(&Requirements::new().role("administrator")));
    }

    #[tokio::test]
    async fn test_restore_without_token_skips_lookup() {
        let mut server = mockito::Server::new_async().await;
        let me = server
            .mock("GET", "/me")
            .expect(0)
            .create_async()
            .await;

        let session = provider(&server.url());
        session.restore().await;

        assert!(!session.is_authenticated());
        me.assert_async().await;
    }
}
