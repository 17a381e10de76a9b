use super::context::{full_body, BoxBody, RequestContext};
use super::dispatcher::Dispatcher;
use super::message::ProxyRequest;
use crate::error::GatewayError;
use crate::upstream::{Backend, Fallback};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;

/// Handle one downstream request: buffer it (up to `max_body_bytes`), run it
/// through the dispatcher, write the response, then record metrics and the
/// access log.
pub async fn handle_request<B: Backend, F: Fallback>(
    req: Request<Incoming>,
    dispatcher: Arc<Dispatcher<B, F>>,
    peer_addr: SocketAddr,
    max_body_bytes: u64,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let uri_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    let (parts, body) = req.into_parts();
    let mut req_headers = parts.headers;

    // Determine the real client IP: trust existing X-Forwarded-For left-most
    // entry if present (assumes a trusted reverse proxy in front), otherwise
    // fall back to the TCP peer address.
    let client_ip = req_headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    remove_hop_headers(&mut req_headers);
    inject_forwarded_headers(&mut req_headers, peer_addr, &host);

    let mut ctx = RequestContext::new(host, uri_path, method, client_ip);

    let body = match read_body(&req_headers, body, max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            tracing::debug!("proxy: request body rejected, path={}, error={}", ctx.uri_path, e);
            let resp = ctx.error_response(&e);
            ctx.access_log(resp.status().as_u16());
            return Ok(resp);
        }
    };
    let proxy_req = ProxyRequest {
        method: parts.method,
        uri: parts.uri,
        headers: req_headers,
        body,
    };

    let dispatched = match dispatcher.handle(proxy_req).await {
        Ok(d) => d,
        Err(e) => {
            tracing::debug!("proxy: request rejected, path={}, error={}", ctx.uri_path, e);
            let resp = ctx.error_response(&e);
            ctx.access_log(resp.status().as_u16());
            return Ok(resp);
        }
    };

    ctx.route_id = dispatched.route_id;
    ctx.breaker_id = dispatched.breaker_id;
    ctx.upstream_addr = dispatched.upstream.unwrap_or_default();
    ctx.fallback = dispatched.fallback;

    let upstream = dispatched.response;
    let status = upstream.status;
    let mut headers = upstream.headers;
    remove_hop_headers(&mut headers);

    let mut resp = Response::new(full_body(upstream.body));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;

    ctx.finalize_metrics(status.as_u16());
    ctx.access_log(status.as_u16());
    Ok(resp)
}

/// Buffer a request body, refusing anything over `limit` bytes. A declared
/// `Content-Length` above the limit is rejected before any of the body is read.
async fn read_body<T>(headers: &HeaderMap, body: T, limit: u64) -> Result<Bytes, GatewayError>
where
    T: Body<Data = Bytes>,
    T::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(GatewayError::PayloadTooLarge(limit));
    }

    let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);
    match Limited::new(body, limit_usize).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(GatewayError::PayloadTooLarge(limit))
        }
        Err(e) => Err(GatewayError::BadRequest(e.to_string())),
    }
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so backends can
/// identify the original client and protocol.
///
/// - `X-Forwarded-For`: append the TCP peer IP to any existing value.
/// - `X-Forwarded-Proto`: keep an incoming value, otherwise `http`.
/// - `X-Forwarded-Host`: the original `Host` header value.
/// - `X-Real-IP`: always the immediate peer.
fn inject_forwarded_headers(
    headers: &mut http::HeaderMap,
    peer_addr: SocketAddr,
    original_host: &str,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Full, StreamBody};

    fn peer() -> SocketAddr {
        "192.168.1.10:50000".parse().unwrap()
    }

    #[test]
    fn test_forwarded_headers_fresh() {
        let mut h = HeaderMap::new();
        inject_forwarded_headers(&mut h, peer(), "gw.example.com");
        assert_eq!(h["x-forwarded-for"], "192.168.1.10");
        assert_eq!(h["x-forwarded-proto"], "http");
        assert_eq!(h["x-forwarded-host"], "gw.example.com");
        assert_eq!(h["x-real-ip"], "192.168.1.10");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        h.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        inject_forwarded_headers(&mut h, peer(), "");
        assert_eq!(h["x-forwarded-for"], "1.2.3.4, 192.168.1.10");
        assert_eq!(h["x-forwarded-proto"], "https");
        assert!(h.get("x-forwarded-host").is_none());
    }

    #[test]
    fn test_remove_hop_headers() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        h.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        h.insert("upgrade", HeaderValue::from_static("websocket"));
        h.insert("x-request-id", HeaderValue::from_static("abc"));
        remove_hop_headers(&mut h);
        assert_eq!(h.len(), 1);
        assert_eq!(h["x-request-id"], "abc");
    }

    #[tokio::test]
    async fn test_read_body_within_limit() {
        let body = Full::new(Bytes::from_static(b"hello"));
        let bytes = read_body(&HeaderMap::new(), body, 5).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_body_rejects_declared_length() {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_LENGTH, HeaderValue::from_static("2048"));
        let body = Full::new(Bytes::from_static(b"tiny"));
        match read_body(&h, body, 1024).await {
            Err(GatewayError::PayloadTooLarge(limit)) => assert_eq!(limit, 1024),
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_body_rejects_oversized_stream() {
        // No Content-Length: the limit is enforced while reading frames.
        let chunks = (0..8).map(|_| {
            Ok::<_, std::io::Error>(hyper::body::Frame::data(Bytes::from(vec![b'x'; 256])))
        });
        let body = StreamBody::new(futures_util::stream::iter(chunks));
        match read_body(&HeaderMap::new(), body, 1024).await {
            Err(GatewayError::PayloadTooLarge(limit)) => assert_eq!(limit, 1024),
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
    }
}
