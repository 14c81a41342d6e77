//! `/ws/*` 원시 터널
//!
//! 들어온 요청의 머리를 그대로 워커에 다시 쓰고, 워커가 101 로 답하면 양쪽 연결을
//! 업그레이드한 뒤 바이트를 양방향으로 복사한다. 두 방향은 서로 독립이라 한쪽이
//! 반만 닫혀도 다른 쪽 복사는 계속된다.
//!
//! 업그레이드가 아닌 요청은 HTTP/1.0 으로 보내서 워커가 응답 후 연결을 닫게 한다.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::io::ReaderStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug)]
struct ResponseHead {
    status: StatusCode,
    headers: Vec<(String, String)>,
}

/// 요청 하나를 워커로 잇는다. 워커 연결에 실패하면 502.
pub async fn forward(worker: SocketAddr, mut req: Request) -> Response {
    let upgrade = is_upgrade_request(req.headers());
    let on_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("[Relay] Cannot read tunnel request body: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let target = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let head = serialize_request_head(parts.method.as_str(), target, &parts.headers, body.len(), upgrade);

    let mut stream = match connect(worker).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("[Relay] Tunnel to {} failed: {}", worker, e);
            return bad_gateway();
        }
    };

    let exchange = async {
        stream.write_all(&head).await?;
        if !body.is_empty() {
            stream.write_all(&body).await?;
        }
        read_response_head(&mut stream).await
    };
    let (head, leftover) = match exchange.await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("[Relay] Tunnel handshake with worker failed: {}", e);
            return bad_gateway();
        }
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = head.status;
    copy_headers(&head.headers, response.headers_mut(), head.status == StatusCode::SWITCHING_PROTOCOLS);

    match on_upgrade {
        Some(on_upgrade) if head.status == StatusCode::SWITCHING_PROTOCOLS => {
            tokio::spawn(async move {
                let upgraded = match on_upgrade.await {
                    Ok(u) => u,
                    Err(e) => {
                        tracing::warn!("[Relay] Client upgrade failed: {}", e);
                        return;
                    }
                };
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                    return;
                }
                pump(client, stream).await;
            });
        }
        _ => {
            let reader = std::io::Cursor::new(leftover).chain(stream);
            *response.body_mut() = Body::from_stream(ReaderStream::new(reader));
        }
    }
    response
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Backend unavailable").into_response()
}

async fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

/// 양방향 복사. 각 방향은 원본이 EOF 면 상대 쪽 쓰기를 닫고 끝난다.
pub async fn pump<A, B>(client: A, worker: B)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut worker_r, mut worker_w) = tokio::io::split(worker);

    let upstream = tokio::spawn(async move {
        let n = tokio::io::copy(&mut client_r, &mut worker_w).await;
        let _ = worker_w.shutdown().await;
        n
    });
    let downstream = tokio::spawn(async move {
        let n = tokio::io::copy(&mut worker_r, &mut client_w).await;
        let _ = client_w.shutdown().await;
        n
    });

    let (up, down) = tokio::join!(upstream, downstream);
    tracing::debug!("[Relay] Tunnel closed (up: {:?}, down: {:?})", up.ok(), down.ok());
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    connection_upgrade && headers.contains_key(axum::http::header::UPGRADE)
}

fn serialize_request_head(
    method: &str,
    target: &str,
    headers: &HeaderMap,
    body_len: usize,
    upgrade: bool,
) -> Vec<u8> {
    let version = if upgrade { "HTTP/1.1" } else { "HTTP/1.0" };
    let mut out = format!("{} {} {}\r\n", method, target, version).into_bytes();
    for (name, value) in headers {
        let skip = matches!(name.as_str(), "content-length" | "transfer-encoding")
            || (!upgrade && name.as_str() == "connection");
        if skip {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if body_len > 0 {
        out.extend_from_slice(format!("content-length: {}\r\n", body_len).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// 응답 머리와 그 뒤에 이미 읽힌 바이트
async fn read_response_head<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<(ResponseHead, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = parse_response_head(&buf[..end])?;
            return Ok((head, buf[end + 4..].to_vec()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "worker closed before responding"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_response_head(raw: &[u8]) -> io::Result<ResponseHead> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
    let text = std::str::from_utf8(raw).map_err(|_| invalid("non-utf8 response head"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or_else(|| invalid("empty response head"))?;
    let mut fields = status_line.splitn(3, ' ');
    let version = fields.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(invalid("malformed status line"));
    }
    let status = fields
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid("malformed status code"))?;

    let headers = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    Ok(ResponseHead { status, headers })
}

fn copy_headers(src: &[(String, String)], dst: &mut HeaderMap, upgrading: bool) {
    for (name, value) in src {
        let lower = name.to_ascii_lowercase();
        // 본문 길이는 axum 이 다시 정한다
        if !upgrading && matches!(lower.as_str(), "connection" | "transfer-encoding" | "content-length" | "keep-alive") {
            continue;
        }
        if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(lower.as_bytes()), HeaderValue::from_str(value)) {
            dst.append(n, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::any;
    use axum::Router;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    async fn start_shell(worker: SocketAddr) -> SocketAddr {
        let app = Router::new().route("/ws/*rest", any(move |req: Request| forward(worker, req)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn start_echo_worker() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_text() && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn parses_switching_protocols_head() {
        let head = parse_response_head(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade",
        )
        .unwrap();
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(head.headers.len(), 2);
        assert!(parse_response_head(b"garbage").is_err());
    }

    #[test]
    fn plain_requests_are_downgraded_to_http10() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("localhost"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        let head = serialize_request_head("POST", "/ws/x?a=1", &headers, 3, false);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("POST /ws/x?a=1 HTTP/1.0\r\n"));
        assert!(text.contains("host: localhost\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(text.ends_with("content-length: 3\r\n\r\n"));
    }

    #[tokio::test]
    async fn websocket_traffic_is_tunneled_both_ways() {
        let worker = start_echo_worker().await;
        let shell = start_shell(worker).await;

        let (mut ws, resp) = tokio_tungstenite::connect_async(format!("ws://{}/ws/sync/1", shell))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 101);

        for text in ["one", "two"] {
            ws.send(Message::Text(text.into())).await.unwrap();
            let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(echoed, Message::Text(text.into()));
        }
        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn plain_request_gets_worker_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.0 404 Not Found\r\ncontent-type: text/plain\r\n\r\nno such socket")
                .await
                .unwrap();
        });
        let shell = start_shell(worker).await;

        let resp = reqwest::get(format!("http://{}/ws/unknown", shell)).await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        assert_eq!(resp.text().await.unwrap(), "no such socket");
    }

    #[tokio::test]
    async fn unreachable_worker_is_bad_gateway() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker = unused.local_addr().unwrap();
        drop(unused);
        let shell = start_shell(worker).await;

        let resp = reqwest::get(format!("http://{}/ws/sync/1", shell)).await.unwrap();
        assert_eq!(resp.status().as_u16(), 502);
        assert_eq!(resp.text().await.unwrap(), "Backend unavailable");
    }

    #[tokio::test]
    async fn half_close_does_not_stop_other_direction() {
        let (client_side, client_peer) = tokio::io::duplex(1024);
        let (worker_side, worker_peer) = tokio::io::duplex(1024);
        tokio::spawn(pump(client_peer, worker_peer));

        let (mut client_r, mut client_w) = tokio::io::split(client_side);
        let (mut worker_r, mut worker_w) = tokio::io::split(worker_side);

        client_w.write_all(b"bye").await.unwrap();
        client_w.shutdown().await.unwrap();

        let mut got = Vec::new();
        worker_r.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");

        worker_w.write_all(b"still here").await.unwrap();
        worker_w.shutdown().await.unwrap();
        let mut back = Vec::new();
        client_r.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"still here");
    }
}
