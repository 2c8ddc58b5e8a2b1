//! Proxy server implementation
//! Dispatches management calls, CONNECT tunnels and plain proxied requests

use crate::admin::AdminApi;
use crate::certificate::CertificateAuthority;
use crate::database::RuleStore;
use crate::forwarder::Forwarder;
use crate::rules::{MockResponse, RuleMatcher};
use crate::traffic::{TrafficLog, TrafficRecord};
use crate::tunnel::MitmTunnel;
use crate::wire::{absolute_url, split_host_port, HOP_BY_HOP_HEADERS};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body shared by every path through the proxy
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Proxy server configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind_addr: String,
    /// Listener port, also the management port
    pub port: u16,
    /// Directory holding the management UI (`index.html`, `assets/`)
    pub ui_dir: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 9292,
            ui_dir: PathBuf::from("./dist"),
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    matcher: RuleMatcher,
    forwarder: Forwarder,
    traffic: Arc<TrafficLog>,
    tunnel: MitmTunnel,
    admin: AdminApi,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        store: Arc<RuleStore>,
        traffic: Arc<TrafficLog>,
        forwarder: Forwarder,
    ) -> Self {
        let matcher = RuleMatcher::new(store.rule_set());
        let tunnel = MitmTunnel::new(ca.clone(), matcher.clone(), forwarder.clone(), traffic.clone());
        let admin = AdminApi::new(
            ca,
            store,
            traffic.clone(),
            config.ui_dir.clone(),
            config.port,
        );

        Self {
            config,
            matcher,
            forwarder,
            traffic,
            tunnel,
            admin,
        }
    }

    /// Bind the listener and serve until the process exits
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((self.config.bind_addr.as_str(), self.config.port)).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single client connection
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let io = TokioIo::new(stream);

        // The CONNECT acknowledgment must be exactly the status line
        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .auto_date_header(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        if req.method() != Method::CONNECT && self.is_management_request(&req) {
            return Ok(self.admin.handle(req).await);
        }

        info!("[PROXY] {} {} from {}", req.method(), req.uri(), remote_addr);

        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req));
        }

        Ok(self.handle_direct(req).await)
    }

    /// Loopback host on our own port
    fn is_management_request<B>(&self, req: &Request<B>) -> bool {
        let authority = match request_authority(req) {
            Some(authority) => authority,
            None => return false,
        };

        match split_host_port(&authority) {
            (host, Some(port)) => {
                port == self.config.port && matches!(host, "localhost" | "127.0.0.1" | "::1")
            }
            _ => false,
        }
    }

    /// Acknowledge the CONNECT, then take over the connection for interception
    fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let dest = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => return text_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port"),
        };

        let tunnel = self.tunnel.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => tunnel.serve(TokioIo::new(upgraded), dest).await,
                Err(e) => warn!("Failed to take over CONNECT connection to {}: {}", dest, e),
            }
        });

        let mut response = Response::new(empty_body());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    /// Plain proxied request: mock it or forward it, streaming the upstream body back
    async fn handle_direct(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let url = direct_url(&req);
        let started = Instant::now();

        if let Some(rule) = self.matcher.find_match(&url) {
            info!("[MOCK] {} {} matched rule '{}'", method, url, rule.name);
            rule.apply_delay().await;

            let response = mock_response(&rule.response);
            self.traffic.append(TrafficRecord::new(
                &method,
                &url,
                response.status(),
                true,
                started.elapsed(),
            ));
            return response;
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("Failed to read request body for {}: {}", url, e);
                return text_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        let upstream = match self.forwarder.forward(&method, &url, &parts.headers, body).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Upstream request {} {} failed: {}", method, url, e);
                let response = text_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
                self.traffic.append(TrafficRecord::new(
                    &method,
                    &url,
                    response.status(),
                    false,
                    started.elapsed(),
                ));
                return response;
            }
        };

        let status = upstream.status();
        let mut response = Response::new(empty_body());
        *response.status_mut() = status;
        for (name, value) in upstream.headers() {
            if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);
        *response.body_mut() = StreamBody::new(stream).boxed_unsync();

        self.traffic.append(TrafficRecord::new(&method, &url, status, false, started.elapsed()));

        response
    }
}

/// `host[:port]` the request is addressed to
fn request_authority<B>(req: &Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(|h| h.to_string())
        })
}

/// Absolute URL of a plain proxied request; origin-form targets are
/// resolved against the Host header
fn direct_url<B>(req: &Request<B>) -> String {
    if req.uri().scheme().is_some() {
        return req.uri().to_string();
    }

    let host = request_authority(req).unwrap_or_default();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    absolute_url("http", &host, target)
}

/// Build the response for a matched mock rule
pub fn mock_response(mock: &MockResponse) -> Response<ProxyBody> {
    let mut headers = mock.header_map();
    headers.remove(CONTENT_LENGTH);

    let mut response = Response::new(full_body(Bytes::from(mock.body.clone())));
    *response.status_mut() = mock.status();
    *response.headers_mut() = headers;
    response
}

/// Create text response
pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Create full body
pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create empty body
pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
