// Authentication module
// Token storage, renewal and the single-flight refresh guard

mod coordinator;
mod credentials;
mod permissions;
mod refresh;
mod types;

pub use coordinator::{Admission, Dispatch, PendingRequest, RefreshCoordinator, RenewalOutcome};
pub use credentials::{
    Cookie, CookieChange, CookieStore, CredentialStore, MemoryCookieStore, SqliteCookieStore,
    COOKIE_PATH, TOKEN_TTL_DAYS,
};
pub use permissions::Requirements;
pub use refresh::{HttpRenewer, TokenRenewer, REFRESH_PATH};
pub use types::{
    redact, AuthErrorBody, Identity, RefreshRequest, RefreshResponse, SessionResponse,
    SignInCredentials, TokenPair, ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE, TOKEN_EXPIRED_CODE,
};
