//! Upstream forwarding
//! One pooled HTTP client shared by every session, plus raw TLS dialing
//! for connections that leave HTTP framing (WebSocket relays)

use crate::error::{ProxyError, Result};
use crate::wire::{split_host_port, HOP_BY_HOP_HEADERS};
use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::Method;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_TLS_PORT: u16 = 443;

/// Accepts any upstream certificate
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

/// Shared upstream client
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    tls: TlsConnector,
}

impl Forwarder {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        let mut tls_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            client,
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// Send one request upstream. Hop-by-hop headers and the inbound body
    /// framing are dropped; the body is sent with its exact length.
    pub async fn forward(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let url = upstream_url(url)?;

        let mut outbound = headers.clone();
        strip_hop_by_hop(&mut outbound);

        debug!("Forwarding {} {}", method, url);

        let mut request = self.client.request(method.clone(), url).headers(outbound);
        if !body.is_empty() {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    /// Open a TLS connection to `host[:port]` (port 443 when absent)
    pub async fn connect_tls(&self, host_port: &str) -> Result<TlsStream<TcpStream>> {
        let (host, port) = split_host_port(host_port);
        let port = port.unwrap_or(DEFAULT_TLS_PORT);

        let stream = TcpStream::connect((host, port)).await?;
        let server_name = ServerName::try_from(host)
            .map_err(|e| ProxyError::ServerName(format!("{}: {}", host, e)))?
            .to_owned();

        debug!("Opening upstream TLS connection to {}:{}", host, port);

        Ok(self.tls.connect(server_name, stream).await?)
    }
}

/// Parse the target URL, defaulting to plain HTTP when no scheme is given
fn upstream_url(url: &str) -> Result<Url> {
    let parsed = if url.contains("://") {
        Url::parse(url)
    } else {
        Url::parse(&format!("http://{}", url))
    };

    parsed.map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", url, e)))
}

/// Remove headers that only describe the client-to-proxy hop
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("content-length", HeaderValue::from_static("10"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-custom"], "kept");
    }

    #[test]
    fn test_upstream_url_defaults_scheme() {
        assert_eq!(
            upstream_url("example.com:8080/a?b=1").unwrap().as_str(),
            "http://example.com:8080/a?b=1"
        );
        assert_eq!(
            upstream_url("https://example.com/x").unwrap().as_str(),
            "https://example.com/x"
        );
        assert!(matches!(
            upstream_url("http://exa mple.com/"),
            Err(ProxyError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_strips_proxy_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("x-custom", "kept"))
            .and(body_string("payload"))
            .respond_with(ResponseTemplate::new(202).set_body_string("accepted"))
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("kept"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-length", HeaderValue::from_static("999"));

        let forwarder = Forwarder::new().unwrap();
        let response = forwarder
            .forward(
                &Method::POST,
                &format!("{}/echo", server.uri()),
                &headers,
                Bytes::from_static(b"payload"),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 202);
        assert_eq!(response.text().await.unwrap(), "accepted");

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(!received[0]
            .headers
            .keys()
            .any(|name| name.as_str().eq_ignore_ascii_case("proxy-connection")));
    }

    #[tokio::test]
    async fn test_forward_does_not_follow_redirects() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .mount(&server)
            .await;

        let forwarder = Forwarder::new().unwrap();
        let response = forwarder
            .forward(
                &Method::GET,
                &format!("{}/old", server.uri()),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 302);
        assert_eq!(response.headers()["location"], "/new");
    }

    #[tokio::test]
    async fn test_forward_failure_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = Forwarder::new().unwrap();
        let result = forwarder
            .forward(
                &Method::GET,
                &format!("http://{}/", addr),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await;

        assert!(matches!(result, Err(ProxyError::Upstream(_))));
    }
}
