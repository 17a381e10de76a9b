use crate::config::UpstreamConfig;
use crate::discovery::ServiceInstance;
use crate::error::GatewayError;
use crate::proxy::{ProxyRequest, ProxyResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::sync::Arc;

/// Performs one call against a resolved backend instance. The dispatcher
/// bounds it with the breaker's call timeout and drops the future on expiry.
pub trait Backend: Send + Sync + 'static {
    fn send(
        &self,
        target: &ServiceInstance,
        req: ProxyRequest,
    ) -> impl Future<Output = Result<ProxyResponse, GatewayError>> + Send;
}

/// A rustls `ServerCertVerifier` that accepts any certificate without validation.
/// Used when `tls_verify = false`: encryption without upstream identity checks.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Pooled hyper client shared by every route.
///
/// Both `http://` and `https://` instances are supported; HTTP/2 is negotiated
/// via ALPN on TLS connections, plain connections stay on HTTP/1.1.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpBackend {
    pub fn new(cfg: &UpstreamConfig) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_keepalive(Some(cfg.keepalive_pool.idle_timeout));
        http.set_connect_timeout(Some(cfg.connect_timeout));
        http.enforce_http(false);

        let https = if cfg.tls_verify {
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http)
        } else {
            let tls_config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();

            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(cfg.keepalive_pool.idle_timeout)
            .pool_max_idle_per_host(cfg.keepalive_pool.size)
            .build(https);

        Self { client }
    }
}

impl Backend for HttpBackend {
    async fn send(
        &self,
        target: &ServiceInstance,
        req: ProxyRequest,
    ) -> Result<ProxyResponse, GatewayError> {
        let uri: http::Uri = format!("{}{}", target.base_url(), req.path_and_query())
            .parse()
            .map_err(|e| GatewayError::CallFailure(format!("invalid upstream uri: {}", e)))?;

        let mut upstream_req = http::Request::builder()
            .method(req.method)
            .uri(uri)
            .body(Full::new(req.body))
            .map_err(|e| GatewayError::CallFailure(format!("build upstream request: {}", e)))?;
        *upstream_req.headers_mut() = req.headers;
        // The client derives Host from the instance address.
        upstream_req.headers_mut().remove(http::header::HOST);

        let resp = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| GatewayError::CallFailure(format!("{}: {}", target.base_url(), e)))?;

        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| GatewayError::CallFailure(format!("read upstream body: {}", e)))?
            .to_bytes();

        Ok(ProxyResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}
