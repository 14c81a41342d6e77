//! `/api/*` 역방향 프록시
//!
//! 메서드, 헤더, 본문을 그대로 워커에 넘기고 응답은 스트리밍으로 돌려준다.
//! 워커에 닿지 못하면 502 `Backend unavailable`.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_BODY: usize = 512 * 1024 * 1024;

/// 다음 홉으로 넘기지 않는 헤더
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Clone)]
pub struct ProxyTarget {
    client: reqwest::Client,
    base_url: String,
}

impl ProxyTarget {
    /// `base_url` 예: `http://127.0.0.1:8000`
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        // 응답이 스트림일 수 있으니 전체 타임아웃은 두지 않는다
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

pub fn unavailable() -> Response {
    (StatusCode::BAD_GATEWAY, "Backend unavailable").into_response()
}

pub async fn forward(State(target): State<ProxyTarget>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = format!("{}{}", target.base_url, path);

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("[Proxy] Cannot read request body for {}: {}", path, e);
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(n, v);
        }
    }

    let upstream = target
        .client
        .request(method, &url)
        .headers(headers)
        .body(body.to_vec())
        .send()
        .await;
    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!("[Proxy] {} {} failed: {}", parts.method, path, e);
            return unavailable();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out_headers.append(n, v);
        }
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = out_headers;
    response
}
