// Token renewal call

use futures::future::BoxFuture;
use reqwest::Client;

use super::types::{RefreshRequest, RefreshResponse, TokenPair};
use crate::error::{truncate_body, RenewalError};

/// Renewal endpoint path, relative to the API base URL
pub const REFRESH_PATH: &str = "/refresh";

/// Exchanges a refresh token for a new token pair
///
/// Implementations must not route through the authenticated transport:
/// a 401 from the renewal endpoint is a terminal failure, never another
/// renewal.
pub trait TokenRenewer: Send + Sync {
    fn renew<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenPair, RenewalError>>;
}

/// Renewer posting `{ refreshToken }` to `POST /refresh`
#[derive(Clone)]
pub struct HttpRenewer {
    client: Client,
    url: String,
}

impl HttpRenewer {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RenewalError> {
        tracing::info!("Refreshing access token...");

        let response = self
            .client
            .post(&self.url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RenewalError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %truncate_body(&error_text),
                "Token refresh rejected"
            );
            return Err(RenewalError::Rejected {
                status: status.as_u16(),
                message: truncate_body(&error_text),
            });
        }

        let data: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;

        if data.token.is_empty() || data.refresh_token.is_empty() {
            return Err(RenewalError::InvalidResponse(
                "refresh response does not contain both tokens".to_string(),
            ));
        }

        tracing::info!("Access token refreshed");

        Ok(TokenPair {
            access_token: data.token,
            refresh_token: data.refresh_token,
        })
    }
}

impl TokenRenewer for HttpRenewer {
    fn renew<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenPair, RenewalError>> {
        Box::pin(self.refresh(refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn test_refresh_url() {
        let renewer = HttpRenewer::new(Client::new(), "http://localhost:3333/");
        assert_eq!(renewer.url(), "http://localhost:3333/refresh");
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/refresh")
            .match_body(Matcher::Json(json!({ "refreshToken": "R1" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"T2","refreshToken":"R2"}"#)
            .create_async()
            .await;

        let renewer = HttpRenewer::new(Client::new(), &server.url());
        let pair = renewer.renew("R1").await.unwrap();

        assert_eq!(pair, TokenPair::new("T2", "R2"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_401_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/refresh")
            .with_status(401)
            .with_body(r#"{"code":"token.expired"}"#)
            .expect(1)
            .create_async()
            .await;

        let renewer = HttpRenewer::new(Client::new(), &server.url());
        let err = renewer.renew("R1").await.unwrap_err();

        assert!(matches!(err, RenewalError::Rejected { status: 401, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_invalid_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/refresh")
            .with_status(200)
            .with_body(r#"{"token":"T2"}"#)
            .create_async()
            .await;

        let renewer = HttpRenewer::new(Client::new(), &server.url());
        let err = renewer.renew("R1").await.unwrap_err();
        assert!(matches!(err, RenewalError::InvalidResponse(_)));
    }
}
