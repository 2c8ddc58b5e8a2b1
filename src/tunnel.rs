//! TLS-intercepting CONNECT tunnel
//!
//! A session terminates TLS with a leaf certificate for the CONNECT
//! destination, then serves decrypted HTTP/1.1 requests one at a time until
//! the client goes away, asks to close, or upgrades to a WebSocket. A
//! WebSocket upgrade hands the connection to a raw byte relay for the rest
//! of its life.

use crate::certificate::CertificateAuthority;
use crate::forwarder::Forwarder;
use crate::rules::RuleMatcher;
use crate::traffic::{TrafficLog, TrafficRecord};
use crate::wire::{clean_host, is_closed_connection, read_request, TunnelRequest, TunnelResponse};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Per-CONNECT interception handler
#[derive(Clone)]
pub struct MitmTunnel {
    ca: Arc<CertificateAuthority>,
    matcher: RuleMatcher,
    forwarder: Forwarder,
    traffic: Arc<TrafficLog>,
}

impl MitmTunnel {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        matcher: RuleMatcher,
        forwarder: Forwarder,
        traffic: Arc<TrafficLog>,
    ) -> Self {
        Self {
            ca,
            matcher,
            forwarder,
            traffic,
        }
    }

    /// Run one session over a connection whose CONNECT to `dest`
    /// (`host:port`) has already been acknowledged
    pub async fn serve<S>(&self, client: S, dest: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ca = self.ca.clone();
        let host_port = dest.clone();
        let leaf = match tokio::task::spawn_blocking(move || ca.issue_for(&host_port)).await {
            Ok(Ok(leaf)) => leaf,
            Ok(Err(e)) => {
                warn!("Failed to issue certificate for {}: {}", dest, e);
                return;
            }
            Err(e) => {
                warn!("Certificate task for {} failed: {}", dest, e);
                return;
            }
        };

        let server_config = match leaf.server_config() {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid certificate for {}: {}", dest, e);
                return;
            }
        };

        let tls = match TlsAcceptor::from(server_config).accept(client).await {
            Ok(tls) => tls,
            Err(e) => {
                debug!("TLS handshake with client for {} failed: {}", dest, e);
                return;
            }
        };

        let mut stream = BufReader::new(tls);
        let host = clean_host(&dest);

        loop {
            let mut request = match read_request(&mut stream).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) if is_closed_connection(&e) => break,
                Err(e) => {
                    warn!("Error reading tunneled request for {}: {}", dest, e);
                    break;
                }
            };

            if let Err(e) = request.set_host(&host) {
                warn!("Invalid tunnel host {}: {}", host, e);
                break;
            }

            if request.is_websocket_upgrade() {
                self.relay_websocket(stream, &dest, request).await;
                return;
            }

            let url = format!("https://{}{}", host, request.path_and_query());
            let started = Instant::now();

            let response = self.respond(&request, &url).await;
            let written = response.write_to(&mut stream).await;

            self.traffic.append(TrafficRecord::new(
                &request.method,
                &url,
                response.status(),
                response.is_mocked(),
                started.elapsed(),
            ));

            if let Err(e) = written {
                if !is_closed_connection(&e) {
                    debug!("Error writing tunneled response for {}: {}", dest, e);
                }
                return;
            }

            if request.wants_close() {
                break;
            }
        }

        let _ = stream.shutdown().await;
    }

    /// Mock or forward a single decrypted request
    async fn respond(&self, request: &TunnelRequest, url: &str) -> TunnelResponse {
        if let Some(rule) = self.matcher.find_match(url) {
            info!("[MOCK] {} {} matched rule '{}'", request.method, url, rule.name);
            rule.apply_delay().await;
            return TunnelResponse::Mock(rule.response);
        }

        info!("[PROXY] {} {}", request.method, url);

        let upstream = match self
            .forwarder
            .forward(&request.method, url, &request.headers, request.body.clone())
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Upstream request {} {} failed: {}", request.method, url, e);
                return TunnelResponse::proxy_error();
            }
        };

        match TunnelResponse::from_upstream(upstream).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to read upstream response for {}: {}", url, e);
                TunnelResponse::proxy_error()
            }
        }
    }

    /// Replay the upgrade request to the destination over a fresh TLS
    /// connection, then relay raw bytes until either side finishes.
    /// The upstream handshake answer is relayed untouched.
    async fn relay_websocket<S>(&self, mut client: BufReader<S>, dest: &str, request: TunnelRequest)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("[WS] Relaying WebSocket {} {}", dest, request.path_and_query());

        let mut upstream = match self.forwarder.connect_tls(dest).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("WebSocket upstream {} unreachable: {}", dest, e);
                let _ = TunnelResponse::proxy_error().write_to(&mut client).await;
                return;
            }
        };

        // Bytes the client already sent past the upgrade request belong upstream
        let mut head = request.encode();
        head.extend_from_slice(client.buffer());
        let client = client.into_inner();

        if let Err(e) = upstream.write_all(&head).await {
            warn!("Failed to send WebSocket upgrade to {}: {}", dest, e);
            return;
        }

        relay(client, upstream).await;
        info!("[WS] WebSocket relay for {} closed", dest);
    }
}

/// Copy bytes both ways until either direction finishes, then tear down both
pub async fn relay<A, B>(client: A, upstream: B)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut tasks = JoinSet::new();
    tasks.spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        ("client -> upstream", copied)
    });
    tasks.spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        ("upstream -> client", copied)
    });

    match tasks.join_next().await {
        Some(Ok((direction, Ok(bytes)))) => debug!("Relay {} done after {} bytes", direction, bytes),
        Some(Ok((direction, Err(e)))) => debug!("Relay {} ended: {}", direction, e),
        Some(Err(e)) => debug!("Relay task failed: {}", e),
        None => {}
    }

    tasks.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{MatchType, MockResponse, MockRule, RuleSet};
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::{duplex, AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
    use tokio::time::timeout;
    use tokio_rustls::TlsConnector;

    fn mock_rule(url: &str) -> MockRule {
        MockRule {
            id: "mock".to_string(),
            enabled: true,
            name: "mocked path".to_string(),
            url_pattern: url.to_string(),
            match_type: MatchType::Exact,
            response: MockResponse {
                status_code: 201,
                headers: BTreeMap::new(),
                body: "ok".to_string(),
                delay_millis: 0,
            },
        }
    }

    async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> (String, String) {
        let mut head = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap();
            }
            if line == "\r\n" {
                break;
            }
            head.push_str(&line);
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await.unwrap();
        (head, String::from_utf8(body).unwrap())
    }

    #[tokio::test]
    async fn test_session_serves_mock_and_logs_it() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::initialize(dir.path()).unwrap());
        let rules = Arc::new(RuleSet::new(vec![mock_rule("https://example.com/mocked-path")]));
        let traffic = Arc::new(TrafficLog::default());
        let tunnel = MitmTunnel::new(
            ca.clone(),
            RuleMatcher::new(rules),
            Forwarder::new().unwrap(),
            traffic.clone(),
        );

        let (client_io, server_io) = duplex(64 * 1024);
        let session = tokio::spawn(async move {
            tunnel.serve(server_io, "example.com:443".to_string()).await;
        });

        let mut roots = RootCertStore::empty();
        roots.add(ca.root_der()).unwrap();
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let tls = TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from("example.com").unwrap(), client_io)
            .await
            .unwrap();
        let mut tls = tokio::io::BufReader::new(tls);

        tls.write_all(b"GET /mocked-path HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = read_response(&mut tls).await;
        assert!(head.starts_with("HTTP/1.1 201 Created\r\n"));
        assert_eq!(body, "ok");

        // Keep-alive: a second request on the same tunnel
        tls.write_all(b"GET /mocked-path HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let (head, _) = read_response(&mut tls).await;
        assert!(head.starts_with("HTTP/1.1 201"));

        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();

        let records = traffic.entries();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.mocked && r.status_code == 201));
        assert_eq!(records[0].url, "https://example.com/mocked-path");
    }

    async fn open_session(
        tunnel: &MitmTunnel,
        ca: &CertificateAuthority,
    ) -> tokio::io::BufReader<tokio_rustls::client::TlsStream<tokio::io::DuplexStream>> {
        let (client_io, server_io) = duplex(64 * 1024);
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            tunnel.serve(server_io, "example.com:443".to_string()).await;
        });

        let mut roots = RootCertStore::empty();
        roots.add(ca.root_der()).unwrap();
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let tls = TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from("example.com").unwrap(), client_io)
            .await
            .unwrap();
        tokio::io::BufReader::new(tls)
    }

    #[tokio::test]
    async fn test_delayed_mock_does_not_hold_other_sessions() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::initialize(dir.path()).unwrap());
        let mut slow = mock_rule("https://example.com/slow");
        slow.id = "slow".to_string();
        slow.response.delay_millis = 400;
        let fast = mock_rule("https://example.com/fast");
        let rules = Arc::new(RuleSet::new(vec![slow, fast]));
        let traffic = Arc::new(TrafficLog::default());
        let tunnel = MitmTunnel::new(
            ca.clone(),
            RuleMatcher::new(rules),
            Forwarder::new().unwrap(),
            traffic.clone(),
        );

        let mut slow_session = open_session(&tunnel, &ca).await;
        let mut fast_session = open_session(&tunnel, &ca).await;

        let started = Instant::now();
        let slow_request = tokio::spawn(async move {
            slow_session
                .write_all(b"GET /slow HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .await
                .unwrap();
            let (head, _) = read_response(&mut slow_session).await;
            (head, started.elapsed())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        fast_session
            .write_all(b"GET /fast HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = read_response(&mut fast_session).await;
        let fast_elapsed = started.elapsed();
        assert!(head.starts_with("HTTP/1.1 201"));
        assert_eq!(body, "ok");
        assert!(fast_elapsed < Duration::from_millis(400), "fast request took {:?}", fast_elapsed);

        let (head, slow_elapsed) = timeout(Duration::from_secs(5), slow_request)
            .await
            .unwrap()
            .unwrap();
        assert!(head.starts_with("HTTP/1.1 201"));
        assert!(slow_elapsed >= Duration::from_millis(400), "slow request took {:?}", slow_elapsed);

        // Records are appended once the response has been written
        timeout(Duration::from_secs(5), async {
            while traffic.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let records = traffic.entries();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].url, "https://example.com/slow");
        assert!(records[0].duration >= Duration::from_millis(400));
        assert_eq!(records[1].url, "https://example.com/fast");
    }

    #[tokio::test]
    async fn test_failed_handshake_ends_session_silently() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::initialize(dir.path()).unwrap());
        let traffic = Arc::new(TrafficLog::default());
        let tunnel = MitmTunnel::new(
            ca,
            RuleMatcher::new(Arc::new(RuleSet::default())),
            Forwarder::new().unwrap(),
            traffic.clone(),
        );

        let (mut client_io, server_io) = duplex(1024);
        let session = tokio::spawn(async move {
            tunnel.serve(server_io, "example.com:443".to_string()).await;
        });

        client_io.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert!(traffic.is_empty());
    }

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let (client, client_peer) = duplex(1024);
        let (upstream, upstream_peer) = duplex(1024);
        let relay_task = tokio::spawn(relay(client, upstream));

        // Larger than the pipe buffers in both directions at once
        let outbound = vec![7u8; 64 * 1024];
        let inbound = vec![9u8; 64 * 1024];
        let mut received_upstream = vec![0u8; outbound.len()];
        let mut received_client = vec![0u8; inbound.len()];

        let (mut client_read, mut client_write) = tokio::io::split(client_peer);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream_peer);

        let (a, b, c, d) = tokio::join!(
            client_write.write_all(&outbound),
            upstream_write.write_all(&inbound),
            upstream_read.read_exact(&mut received_upstream),
            client_read.read_exact(&mut received_client),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        d.unwrap();

        assert_eq!(received_upstream, outbound);
        assert_eq!(received_client, inbound);

        // Client goes away: the relay must finish and close the upstream side
        drop(client_read);
        drop(client_write);
        timeout(Duration::from_secs(5), relay_task).await.unwrap().unwrap();

        let mut rest = Vec::new();
        upstream_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
