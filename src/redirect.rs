//! Permanent redirect backend
//!
//! Answers every request with `303 See Other` pointing at the target host.
//! The request path joins the target's path and query strings merge with the
//! target's query first. The Location is scheme-relative so the client keeps
//! whatever scheme it arrived on.

use crate::handler::{
    full_body, single_joining_slash, HttpRequest, HttpResponse, RouteHandler,
};
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use url::Url;

pub struct RedirectHandler {
    target: Url,
}

impl RedirectHandler {
    pub fn new(target: Url) -> Self {
        Self { target }
    }

    fn location(&self, req: &HttpRequest) -> String {
        let path = if self.target.path().is_empty() {
            req.uri().path().to_string()
        } else {
            single_joining_slash(self.target.path(), req.uri().path())
        };

        let target_query = self.target.query().unwrap_or("");
        let req_query = req.uri().query().unwrap_or("");
        let query = if target_query.is_empty() || req_query.is_empty() {
            format!("{}{}", target_query, req_query)
        } else {
            format!("{}&{}", target_query, req_query)
        };

        let mut authority = self.target.host_str().unwrap_or_default().to_string();
        if let Some(port) = self.target.port() {
            authority = format!("{}:{}", authority, port);
        }

        let mut location = format!("//{}{}", authority, path);
        if !query.is_empty() {
            location.push('?');
            location.push_str(&query);
        }
        location
    }
}

#[async_trait]
impl RouteHandler for RedirectHandler {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        let location = self.location(&req);
        Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(
                LOCATION,
                HeaderValue::from_str(&location)
                    .unwrap_or_else(|_| HeaderValue::from_static("/")),
            )
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full_body("See Other"))
            .expect("valid response builder")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::empty_body;
    use hyper::Request;

    fn location_for(target: &str, uri: &str) -> String {
        let handler = RedirectHandler::new(Url::parse(target).unwrap());
        let req: HttpRequest = Request::builder().uri(uri).body(empty_body()).unwrap();
        handler.location(&req)
    }

    #[test]
    fn test_redirect_joins_path() {
        assert_eq!(
            location_for("redirect://github.com/owner/repo", "/issues"),
            "//github.com/owner/repo/issues"
        );
    }

    #[test]
    fn test_redirect_merges_queries_target_first() {
        assert_eq!(
            location_for("redirect://example.com/p?a=1", "/x?b=2"),
            "//example.com/p/x?a=1&b=2"
        );
        assert_eq!(
            location_for("redirect://example.com?a=1", "/x"),
            "//example.com/x?a=1"
        );
    }

    #[tokio::test]
    async fn test_redirect_status_and_header() {
        let handler = RedirectHandler::new(Url::parse("redirect://example.com/base").unwrap());
        let req = Request::builder().uri("/p").body(empty_body()).unwrap();
        let resp = handler.handle(req).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            resp.headers().get(LOCATION).unwrap(),
            "//example.com/base/p"
        );
    }
}
