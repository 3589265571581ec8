// Page-level gating for server-rendered views

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::future::Future;

use crate::auth::{CredentialStore, Requirements};
use crate::context::Route;
use crate::error::{Result, SessionError};

/// Result of a guarded page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome<T> {
    Render(T),
    Redirect { destination: Route, permanent: bool },
}

impl<T> PageOutcome<T> {
    fn redirect(destination: Route) -> Self {
        PageOutcome::Redirect {
            destination,
            permanent: false,
        }
    }
}

/// Authorization claims carried in an access token payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

/// Read the claims of a JWT without verifying its signature
///
/// Verification belongs to the API; the claims here only pick which page
/// to show.
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let payload = token.split('.').nth(1).ok_or(SessionError::AuthToken)?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| {
            tracing::debug!(error = %e, "Access token payload is not base64url");
            SessionError::AuthToken
        })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        tracing::debug!(error = %e, "Access token payload is not valid JSON");
        SessionError::AuthToken
    })
}

/// Guard for guest-only pages: signed-in visitors go to the dashboard
pub fn with_ssr_guest(store: &CredentialStore) -> Result<PageOutcome<()>> {
    if store.access_token()?.is_some() {
        return Ok(PageOutcome::redirect(Route::Dashboard));
    }
    Ok(PageOutcome::Render(()))
}

/// Guard for authenticated pages
///
/// Visitors without a token go to the guest view; tokens missing the
/// required permissions or roles go to the dashboard. When the page itself
/// hits an unrecoverable auth failure the stored tokens are dropped and the
/// visitor goes to the guest view. Other page errors propagate.
pub async fn with_ssr_auth<T, F, Fut>(
    store: &CredentialStore,
    requirements: Option<&Requirements>,
    page: F,
) -> Result<PageOutcome<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let token = match store.access_token()? {
        Some(token) => token,
        None => return Ok(PageOutcome::redirect(Route::Guest)),
    };

    if let Some(requirements) = requirements {
        let claims = match decode_claims(&token) {
            Ok(claims) => claims,
            Err(_) => return expel(store),
        };

        if !requirements.is_satisfied_by(&claims.permissions, &claims.roles) {
            tracing::info!("Visitor lacks permissions for page");
            return Ok(PageOutcome::redirect(Route::Dashboard));
        }
    }

    match page().await {
        Ok(rendered) => Ok(PageOutcome::Render(rendered)),
        Err(e) if e.is_auth_failure() => {
            tracing::warn!(error = %e, "Session ended while rendering page");
            expel(store)
        }
        Err(e) => Err(e),
    }
}

fn expel<T>(store: &CredentialStore) -> Result<PageOutcome<T>> {
    store.clear()?;
    Ok(PageOutcome::redirect(Route::Guest))
}
