//! Plain-text HTTP error responses for the proxy

use crate::handler::{full_body, HttpResponse};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};

/// Build a plain-text response with the given status code
pub fn text_response(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message.into()))
        .expect("valid response builder")
}

/// 403 Forbidden with an explicit reason
pub fn forbidden(message: impl Into<String>) -> HttpResponse {
    text_response(StatusCode::FORBIDDEN, message)
}

/// 404 Not Found
pub fn not_found(message: impl Into<String>) -> HttpResponse {
    text_response(StatusCode::NOT_FOUND, message)
}

/// 502 Bad Gateway for upstream failures
pub fn bad_gateway(message: impl Into<String>) -> HttpResponse {
    text_response(StatusCode::BAD_GATEWAY, message)
}

/// 500 Internal Server Error
pub fn internal_error(message: impl Into<String>) -> HttpResponse {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_text_response_status_and_body() {
        let resp = forbidden("Unknown hostname in request: x.test");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Unknown hostname in request: x.test");
    }

    #[tokio::test]
    async fn test_error_helpers() {
        assert_eq!(not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(bad_gateway("x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            internal_error("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
