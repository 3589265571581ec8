use anyhow::Context;
use futures::future::BoxFuture;
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::auth::{
    redact, Admission, AuthErrorBody, CredentialStore, Dispatch, HttpRenewer, PendingRequest,
    RefreshCoordinator, TokenPair, TokenRenewer, TOKEN_EXPIRED_CODE,
};
use crate::context::ExecutionContext;
use crate::error::{RenewalError, Result, SessionError};

/// Request as the caller describes it, replayable after a renewal
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// How a response relates to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    /// 401 with `token.expired`: recoverable through a renewal
    Expired,
    /// Any other 401: the session cannot be recovered
    Invalid { code: Option<String> },
    /// Not an authorization failure
    Unrelated,
}

/// Classify a response from its status and body
pub fn classify(status: StatusCode, body: &str) -> ResponseClass {
    if status != StatusCode::UNAUTHORIZED {
        return ResponseClass::Unrelated;
    }

    let code = serde_json::from_str::<AuthErrorBody>(body)
        .unwrap_or_default()
        .code;

    match code.as_deref() {
        Some(TOKEN_EXPIRED_CODE) => ResponseClass::Expired,
        _ => ResponseClass::Invalid { code },
    }
}

/// Authenticated HTTP client for the application API
///
/// Every request carries the current access token. Expired tokens are
/// renewed once per expiry, however many requests hit the expiry at the same
/// time; the affected requests are replayed with the new token.
///
/// Clone is cheap: clones share the token, the refresh guard and the
/// connection pool.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API base URL without trailing slash
    base_url: String,

    /// Token stamped on every request
    default_token: RwLock<Option<String>>,

    store: CredentialStore,
    coordinator: RefreshCoordinator,
    renewer: Arc<dyn TokenRenewer>,
    context: ExecutionContext,
}

impl ApiClient {
    /// Create a client renewing tokens through `POST /refresh`
    pub fn new(
        base_url: &str,
        store: CredentialStore,
        context: ExecutionContext,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let renewer = Arc::new(HttpRenewer::new(client.clone(), base_url));
        Ok(Self::from_parts(client, base_url, store, context, renewer))
    }

    /// Create a client from existing parts
    ///
    /// The default token is seeded from `store`.
    pub fn from_parts(
        client: Client,
        base_url: &str,
        store: CredentialStore,
        context: ExecutionContext,
        renewer: Arc<dyn TokenRenewer>,
    ) -> Self {
        let default_token = match store.access_token() {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stored access token");
                None
            }
        };

        Self {
            inner: Arc::new(ClientInner {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                default_token: RwLock::new(default_token),
                store,
                coordinator: RefreshCoordinator::new(),
                renewer,
                context,
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.inner.context
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    /// Token stamped on the next request
    pub fn default_token(&self) -> Option<String> {
        self.inner
            .default_token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_default_token(&self, token: Option<String>) {
        *self
            .inner
            .default_token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    /// Switch to another session, or to none
    ///
    /// Stamps `token` on the next request and drops whatever the refresh
    /// guard remembers about the previous session.
    pub fn replace_session(&self, token: Option<String>) {
        self.set_default_token(token);
        self.inner.coordinator.reset();
    }

    /// Send a request with the current token
    ///
    /// - 2xx: returned as is
    /// - 401 `token.expired`: waits for a renewal, then replays
    /// - other 401: signs out (client) or fails with `AuthToken` (server)
    /// - anything else: `SessionError::Api`
    pub async fn request(&self, request: ApiRequest) -> Result<Response> {
        let generation = self.inner.coordinator.generation();
        let token = self.default_token();
        let response = self.send(&request, token.as_deref()).await?;
        self.intercept(request, response, generation, false).await
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request(ApiRequest::get(path)).await?;
        decode(response).await
    }

    /// POST `body` as JSON to `path` and decode the JSON answer
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_value(body).context("Failed to encode request body")?;
        let response = self.request(ApiRequest::post(path).json(body)).await?;
        decode(response).await
    }

    /// PUT `body` as JSON to `path` and decode the JSON answer
    pub async fn put_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_value(body).context("Failed to encode request body")?;
        let response = self.request(ApiRequest::put(path).json(body)).await?;
        decode(response).await
    }

    /// DELETE `path`, ignoring the body
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.request(ApiRequest::delete(path)).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.inner.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response> {
        let url = self.url(&request.path);
        tracing::debug!(
            method = %request.method,
            url = %url,
            token = %token.map(redact).unwrap_or_else(|| "none".to_string()),
            "Sending HTTP request"
        );

        let mut builder = self.inner.client.request(request.method.clone(), &url);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        match builder.send().await {
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Received HTTP response");
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    error_kind = error_kind(&e),
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                Err(SessionError::Http(e))
            }
        }
    }

    /// Response interceptor
    async fn intercept(
        &self,
        request: ApiRequest,
        response: Response,
        generation: u64,
        replayed: bool,
    ) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();

        match classify(status, &body) {
            ResponseClass::Unrelated => {
                tracing::warn!(
                    status = status.as_u16(),
                    method = %request.method,
                    path = %request.path,
                    "Request failed with error response"
                );
                Err(SessionError::api(status.as_u16(), &body))
            }
            ResponseClass::Expired if !replayed => {
                tracing::info!(
                    method = %request.method,
                    path = %request.path,
                    "Access token expired, waiting for renewal"
                );
                self.on_expired(request, generation).await
            }
            ResponseClass::Expired => {
                tracing::warn!(
                    path = %request.path,
                    "Renewed token rejected as expired, giving up on request"
                );
                self.on_invalid(Some(TOKEN_EXPIRED_CODE.to_string()))
            }
            ResponseClass::Invalid { code } => {
                tracing::warn!(
                    path = %request.path,
                    code = code.as_deref().unwrap_or("none"),
                    "Access token rejected"
                );
                self.on_invalid(code)
            }
        }
    }

    fn on_invalid(&self, code: Option<String>) -> Result<Response> {
        match &self.inner.context {
            ExecutionContext::Client(ctx) => {
                ctx.sign_out();
                self.replace_session(None);
                Err(SessionError::Unauthorized { code })
            }
            ExecutionContext::Server => Err(SessionError::AuthToken),
        }
    }

    /// Queue `request` behind the renewal for its expiry and replay it once
    /// the renewal settles
    async fn on_expired(&self, request: ApiRequest, generation: u64) -> Result<Response> {
        let (tx, rx) = oneshot::channel::<Result<Replayed>>();
        let client = self.clone();

        let pending = PendingRequest::new(move |outcome| -> Dispatch {
            Box::pin(async move {
                let sent = match outcome {
                    Ok(token) => client.resend(request, token).await,
                    Err(error) => Err(SessionError::Renewal(error)),
                };
                let _ = tx.send(sent);
            })
        });

        match self.inner.coordinator.enqueue(pending, generation) {
            Admission::Started => {
                let client = self.clone();
                tokio::spawn(async move { client.run_renewal().await });
            }
            Admission::Joined => {}
            Admission::AlreadyRenewed(dispatch) => dispatch.await,
        }

        let replayed = rx.await.map_err(|_| {
            SessionError::Internal(anyhow::anyhow!("Renewal cycle dropped a queued request"))
        })??;

        self.check_replay(replayed).await
    }

    /// Resend `request` with the renewed token, up to the response headers
    async fn resend(&self, request: ApiRequest, token: String) -> Result<Replayed> {
        tracing::debug!(
            method = %request.method,
            path = %request.path,
            "Replaying request with renewed token"
        );
        let generation = self.inner.coordinator.generation();
        let response = self.send(&request, Some(&token)).await?;
        Ok(Replayed {
            request,
            response,
            generation,
        })
    }

    /// Run a replay's response through the interceptor
    ///
    /// Boxed so the interceptor's future type does not contain itself.
    fn check_replay(&self, replayed: Replayed) -> BoxFuture<'static, Result<Response>> {
        let client = self.clone();
        Box::pin(async move {
            let Replayed {
                request,
                response,
                generation,
            } = replayed;
            client.intercept(request, response, generation, true).await
        })
    }

    /// One renewal cycle: renew, persist, update the default token, then
    /// dispatch the queue
    ///
    /// Dispatches run one at a time in queue order. Each replay is sent and
    /// answered before the next one goes out, so the API sees the replays in
    /// the order the requests expired.
    async fn run_renewal(&self) {
        let outcome = self.renew_tokens().await;

        let dispatches = match outcome {
            Ok(pair) => {
                tracing::info!("Token renewal succeeded");
                self.inner.coordinator.settle(Ok(pair.access_token))
            }
            Err(error) => {
                tracing::error!(error = %error, "Token renewal failed");

                // Session is gone before any queued caller hears about it
                match &self.inner.context {
                    ExecutionContext::Client(ctx) => ctx.sign_out(),
                    ExecutionContext::Server => {
                        if let Err(e) = self.inner.store.clear() {
                            tracing::error!(error = %e, "Failed to clear credentials");
                        }
                    }
                }
                self.set_default_token(None);
                self.inner.coordinator.settle(Err(error))
            }
        };

        tracing::debug!(count = dispatches.len(), "Dispatching queued requests");
        for dispatch in dispatches {
            dispatch.await;
        }
    }

    async fn renew_tokens(&self) -> std::result::Result<TokenPair, RenewalError> {
        let refresh_token = self
            .inner
            .store
            .get()
            .map_err(|e| RenewalError::Store(e.to_string()))?
            .map(|pair| pair.refresh_token)
            .ok_or(RenewalError::MissingRefreshToken)?;

        let pair = self.inner.renewer.renew(&refresh_token).await?;

        self.inner
            .store
            .set(&pair)
            .map_err(|e| RenewalError::Store(e.to_string()))?;
        self.set_default_token(Some(pair.access_token.clone()));

        Ok(pair)
    }
}

/// A replay that got its response headers back
struct Replayed {
    request: ApiRequest,
    response: Response,
    generation: u64,
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| SessionError::InvalidResponse(e.to_string()))
}

/// Categorize a transport error for logs
fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}
