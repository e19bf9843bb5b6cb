// In-flight request dedup: identical requests (method + URL + client IP)
// arriving while one is being served share its buffered response, which
// keeps serving the same key for one second after completion.
//
// Only GET requests are collapsed; creates and deletes must each reach
// their handler.

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::Response;
use std::time::Duration;

use super::rate_limit::client_ip;
use crate::api::AppState;

/// How long a completed response keeps answering identical requests.
pub const DEDUP_LINGER: Duration = Duration::from_secs(1);

/// Responses are buffered to be shareable; anything above this is treated
/// as a server error rather than held in memory.
const MAX_BUFFERED_BODY: usize = 8 * 1024 * 1024;

/// A fully buffered response, cloneable to every deduplicated caller.
#[derive(Clone)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl BufferedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Dedup key: `method:url:ip`, with the URL including its query string.
pub fn dedup_key(method: &Method, uri: &Uri, ip: &str) -> String {
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{}:{}:{}", method, url, ip)
}

pub async fn inflight_dedup_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let key = dedup_key(req.method(), req.uri(), &client_ip(&req));

    state
        .inflight
        .run(&key, || async move {
            let response = next.run(req).await;
            buffer_response(response).await
        })
        .await
        .into_response()
}

async fn buffer_response(response: Response) -> BufferedResponse {
    let (parts, body) = response.into_parts();
    match to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => BufferedResponse {
            status: parts.status,
            headers: parts.headers,
            body: bytes,
        },
        Err(e) => {
            tracing::warn!("Failed to buffer response for request dedup: {}", e);
            BufferedResponse {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_method_url_and_ip() {
        let uri: Uri = "/api/scans/abc/status?x=1".parse().unwrap();
        assert_eq!(
            dedup_key(&Method::GET, &uri, "203.0.113.9"),
            "GET:/api/scans/abc/status?x=1:203.0.113.9"
        );
    }

    #[test]
    fn distinct_clients_get_distinct_keys() {
        let uri: Uri = "/api/scans".parse().unwrap();
        let a = dedup_key(&Method::GET, &uri, "203.0.113.9");
        let b = dedup_key(&Method::GET, &uri, "203.0.113.10");
        assert_ne!(a, b);
    }

    #[test]
    fn buffered_response_round_trips() {
        let buffered = BufferedResponse {
            status: StatusCode::OK,
            headers: {
                let mut h = HeaderMap::new();
                h.insert("content-type", "application/json".parse().unwrap());
                h
            },
            body: Bytes::from_static(b"{\"ok\":true}"),
        };
        let response = buffered.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
