// Cookie jar and CORS middleware

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{CookieChange, MemoryCookieStore, ACCESS_TOKEN_COOKIE, COOKIE_PATH, REFRESH_TOKEN_COOKIE};

/// Per-request cookie jar, inserted as a request extension
#[derive(Clone)]
pub struct RequestJar(pub MemoryCookieStore);

/// Cookie jar middleware
///
/// Seeds a jar from the session cookies the browser sent and, once the
/// handler is done, writes every change made to it back as `Set-Cookie`.
pub async fn cookie_jar_middleware(mut request: Request<Body>, next: Next) -> Response {
    let cookies = session_cookies(request.headers());
    let jar = MemoryCookieStore::seeded(
        cookies
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
    );
    request.extensions_mut().insert(RequestJar(jar.clone()));

    let mut response = next.run(request).await;

    for change in jar.take_changes() {
        match HeaderValue::from_str(&set_cookie_value(&change)) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(error = %e, "Skipping cookie that is not a valid header"),
        }
    }

    response
}

/// Session cookies found in the `Cookie` headers
fn session_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name != ACCESS_TOKEN_COOKIE && name != REFRESH_TOKEN_COOKIE {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .filter(|(_, value)| !value.is_empty())
        .collect()
}

/// `Set-Cookie` value for one jar change
fn set_cookie_value(change: &CookieChange) -> String {
    match change {
        CookieChange::Set(cookie) => format!(
            "{}={}; Path={}; Max-Age={}; SameSite=Lax",
            cookie.name,
            cookie.value,
            COOKIE_PATH,
            cookie.max_age.num_seconds()
        ),
        CookieChange::Removed(name) => format!("{}=; Path={}; Max-Age=0", name, COOKIE_PATH),
    }
}

/// Create CORS middleware layer
///
/// Configures CORS to allow all origins, methods, and headers.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Cookie, CookieStore};
    use axum::{extract::Extension, http::StatusCode, routing::get, Router};
    use tower::util::ServiceExt;

    async fn read_handler(Extension(RequestJar(jar)): Extension<RequestJar>) -> String {
        jar.read(&[ACCESS_TOKEN_COOKIE])
            .unwrap()
            .remove(0)
            .unwrap_or_else(|| "none".to_string())
    }

    async fn write_handler(Extension(RequestJar(jar)): Extension<RequestJar>) -> &'static str {
        jar.write(&[Cookie {
            name: ACCESS_TOKEN_COOKIE.to_string(),
            value: "T2".to_string(),
            max_age: chrono::Duration::days(30),
        }])
        .unwrap();
        jar.remove(&[REFRESH_TOKEN_COOKIE]).unwrap();
        "OK"
    }

    fn app() -> Router {
        Router::new()
            .route("/read", get(read_handler))
            .route("/write", get(write_handler))
            .layer(axum::middleware::from_fn(cookie_jar_middleware))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_session_cookies_ignores_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; authrkst.token=T1; authrkst.refreshToken=R1; x=1"),
        );

        assert_eq!(
            session_cookies(&headers),
            vec![
                ("authrkst.token".to_string(), "T1".to_string()),
                ("authrkst.refreshToken".to_string(), "R1".to_string()),
            ]
        );
    }

    #[test]
    fn test_set_cookie_values() {
        let set = CookieChange::Set(Cookie {
            name: "authrkst.token".to_string(),
            value: "T2".to_string(),
            max_age: chrono::Duration::days(30),
        });
        assert_eq!(
            set_cookie_value(&set),
            "authrkst.token=T2; Path=/; Max-Age=2592000; SameSite=Lax"
        );
        assert_eq!(
            set_cookie_value(&CookieChange::Removed("authrkst.token".to_string())),
            "authrkst.token=; Path=/; Max-Age=0"
        );
    }

    #[tokio::test]
    async fn test_jar_seeded_from_request() {
        let request = Request::builder()
            .uri("/read")
            .header(header::COOKIE, "authrkst.token=T1")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(body_string(response).await, "T1");
    }

    #[tokio::test]
    async fn test_changes_written_back() {
        let request = Request::builder()
            .uri("/write")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        let cookies: Vec<_> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();

        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("authrkst.token=T2;"));
        assert!(cookies[1].starts_with("authrkst.refreshToken=;"));
        assert!(cookies[1].contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_cors_layer_allows_all_origins() {
        let app = Router::new()
            .route("/test", get(|| async { "OK" }))
            .layer(cors_layer());

        let request = Request::builder()
            .uri("/test")
            .header("origin", "https://example.com")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }
}
