use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Form, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use anyhow::Context;

use crate::auth::{
    CredentialStore, HttpRenewer, Identity, MemoryCookieStore, Requirements, SessionResponse,
    SignInCredentials, TokenPair,
};
use crate::config::Config;
use crate::context::{ExecutionContext, Route};
use crate::error::SessionError;
use crate::http_client::ApiClient;
use crate::middleware::{self, RequestJar};
use crate::session::{ME_PATH, SESSIONS_PATH};
use crate::ssr::{with_ssr_auth, with_ssr_guest, PageOutcome};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Permission the metrics page requires
pub const METRICS_PERMISSION: &str = "metrics.list";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Shared HTTP client with connection pooling
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.http_connect_timeout))
            .timeout(Duration::from_secs(config.http_request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    /// Credential store over this request's cookie jar
    fn store(&self, jar: MemoryCookieStore) -> CredentialStore {
        CredentialStore::with_ttl(Arc::new(jar), self.config.token_ttl())
    }

    /// Server-context transport for one render
    fn client(&self, store: CredentialStore) -> ApiClient {
        ApiClient::from_parts(
            self.http.clone(),
            &self.config.api_url,
            store,
            ExecutionContext::Server,
            Arc::new(HttpRenewer::new(self.http.clone(), &self.config.api_url)),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

/// Build the server-rendered application with all routes and middleware
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/", get(guest_handler).post(login_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::cors_layer())
                .layer(axum::middleware::from_fn(middleware::cookie_jar_middleware)),
        )
        .with_state(state)
}

/// GET /health - Health check
///
/// Does not touch the session (for load balancers).
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET / - Sign-in page, guests only
async fn guest_handler(
    State(state): State<AppState>,
    Extension(RequestJar(jar)): Extension<RequestJar>,
) -> Result<Response, SessionError> {
    let store = state.store(jar);

    Ok(match with_ssr_guest(&store)? {
        PageOutcome::Render(()) => Html(login_page(None)).into_response(),
        outcome => redirect(outcome),
    })
}

/// POST / - Sign in from the login form
///
/// Failures are logged and the form is shown again.
async fn login_handler(
    State(state): State<AppState>,
    Extension(RequestJar(jar)): Extension<RequestJar>,
    Form(form): Form<LoginForm>,
) -> Result<Response, SessionError> {
    let store = state.store(jar);
    let client = state.client(store.clone());
    let credentials = SignInCredentials::new(form.email, form.password);

    match client
        .post_json::<_, SessionResponse>(SESSIONS_PATH, &credentials)
        .await
    {
        Ok(session) => {
            store.set(&TokenPair::new(session.token, session.refresh_token))?;
            tracing::info!(email = %credentials.email, "Signed in");
            Ok(Redirect::to(Route::Dashboard.path()).into_response())
        }
        Err(e) => {
            tracing::error!(email = %credentials.email, error = %e, "Sign in error");
            Ok((
                StatusCode::UNAUTHORIZED,
                Html(login_page(Some("Sign in failed"))),
            )
                .into_response())
        }
    }
}

/// GET /dashboard - Signed-in landing page
async fn dashboard_handler(
    State(state): State<AppState>,
    Extension(RequestJar(jar)): Extension<RequestJar>,
) -> Result<Response, SessionError> {
    let store = state.store(jar);
    let client = state.client(store.clone());

    let outcome = with_ssr_auth(&store, None, move || async move {
        client.get_json::<Identity>(ME_PATH).await
    })
    .await?;

    Ok(match outcome {
        PageOutcome::Render(identity) => Html(dashboard_page(&identity)).into_response(),
        outcome => redirect(outcome),
    })
}

/// GET /metrics - Requires the `metrics.list` permission
async fn metrics_handler(
    State(state): State<AppState>,
    Extension(RequestJar(jar)): Extension<RequestJar>,
) -> Result<Response, SessionError> {
    let store = state.store(jar);
    let client = state.client(store.clone());
    let requirements = Requirements::new().permission(METRICS_PERMISSION);

    let outcome = with_ssr_auth(&store, Some(&requirements), move || async move {
        client.get_json::<Identity>(ME_PATH).await
    })
    .await?;

    Ok(match outcome {
        PageOutcome::Render(identity) => Html(metrics_page(&identity)).into_response(),
        outcome => redirect(outcome),
    })
}

fn redirect<T>(outcome: PageOutcome<T>) -> Response {
    match outcome {
        PageOutcome::Redirect {
            destination,
            permanent: true,
        } => Redirect::permanent(destination.path()).into_response(),
        PageOutcome::Redirect { destination, .. } => {
            Redirect::temporary(destination.path()).into_response()
        }
        PageOutcome::Render(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn login_page(error: Option<&str>) -> String {
    let error = error
        .map(|e| format!("<p class=\"error\">{}</p>", escape_html(e)))
        .unwrap_or_default();

    format!(
        r#"<!doctype html>
<html>
<head><title>Sign in</title></head>
<body>
<form method="post" action="/">
{error}
<input type="email" name="email" placeholder="E-mail">
<input type="password" name="password" placeholder="Password">
<button type="submit">Sign in</button>
</form>
</body>
</html>"#
    )
}

fn dashboard_page(identity: &Identity) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><title>Dashboard</title></head>
<body>
<h1>Dashboard: {}</h1>
</body>
</html>"#,
        escape_html(&identity.email)
    )
}

fn metrics_page(identity: &Identity) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><title>Metrics</title></head>
<body>
<h1>Metrics</h1>
<p>Signed in as {}</p>
</body>
</html>"#,
        escape_html(&identity.email)
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
