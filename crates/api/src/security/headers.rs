//! Security headers added to every API response

use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, Request, Response},
    middleware::Next,
};

const API_CSP: &str = "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'none'";

/// Headers applied unless the handler already set them
fn defaults() -> [(HeaderName, HeaderValue); 6] {
    [
        (header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
        (header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
        (
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
        (
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
        ),
        (header::CONTENT_SECURITY_POLICY, HeaderValue::from_static(API_CSP)),
        // Client records and chats must not sit in shared caches
        (
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, private"),
        ),
    ]
}

pub async fn security_headers_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    for (name, value) in defaults() {
        headers.entry(name).or_insert(value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
    use tower::ServiceExt;

    async fn plain() -> &'static str {
        "ok"
    }

    async fn cached_media() -> impl IntoResponse {
        (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "private, max-age=3600")],
            "bytes",
        )
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(plain))
            .route("/media", get(cached_media))
            .layer(axum::middleware::from_fn(security_headers_middleware))
    }

    #[tokio::test]
    async fn test_security_headers_are_added() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("cache-control").unwrap(), "no-store, private");
        assert_eq!(headers.get("content-security-policy").unwrap(), API_CSP);
    }

    #[tokio::test]
    async fn test_handler_headers_win() {
        let response = app()
            .oneshot(Request::builder().uri("/media").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("cache-control").unwrap(),
            "private, max-age=3600"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    }
}
