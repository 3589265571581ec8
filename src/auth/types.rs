// Session and wire types

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Cookie holding the access token
pub const ACCESS_TOKEN_COOKIE: &str = "authrkst.token";

/// Cookie holding the refresh token
pub const REFRESH_TOKEN_COOKIE: &str = "authrkst.refreshToken";

/// Error code the API puts in a 401 body when the access token merely expired
pub const TOKEN_EXPIRED_CODE: &str = "token.expired";

/// Access/refresh token pair
/// Both halves are always stored and cleared together
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

/// Signed-in user as reported by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

/// Email/password pair posted to `/sessions`
#[derive(Clone, Serialize)]
pub struct SignInCredentials {
    pub email: String,
    pub password: String,
}

impl SignInCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for SignInCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInCredentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// `POST /sessions` response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

/// `POST /refresh` request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// `POST /refresh` response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub token: String,
    pub refresh_token: String,
}

/// Error body the API attaches to 401 responses
#[derive(Debug, Default, Deserialize)]
pub struct AuthErrorBody {
    #[serde(default)]
    pub code: Option<String>,
}

/// Shorten a secret for logs and debug output
pub fn redact(token: &str) -> String {
    if token.chars().count() <= 8 {
        "***".to_string()
    } else {
        format!("{}...", token.chars().take(8).collect::<String>())
    }
}
