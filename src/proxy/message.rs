use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};

/// A buffered inbound request as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path plus query, as forwarded to the backend.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

/// A fully buffered response, from a backend or a fallback.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_and_query() {
        let req = ProxyRequest::new(Method::GET, "/users/1?verbose=true".parse().unwrap());
        assert_eq!(req.path(), "/users/1");
        assert_eq!(req.path_and_query(), "/users/1?verbose=true");
    }

    #[test]
    fn test_response_with_header() {
        let resp = ProxyResponse::new(StatusCode::OK, "ok")
            .with_header("x-test", HeaderValue::from_static("1"));
        assert_eq!(resp.headers["x-test"], "1");
        assert_eq!(resp.body, Bytes::from_static(b"ok"));
    }
}
