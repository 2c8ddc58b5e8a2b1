//! Management API and UI file server
//! Only reached for loopback requests on the proxy's own port

use crate::certificate::CertificateAuthority;
use crate::database::RuleStore;
use crate::error::ProxyError;
use crate::proxy::{empty_body, full_body, text_response, ProxyBody};
use crate::rules::Config;
use crate::traffic::TrafficLog;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

const CA_CONTENT_TYPE: &str = "application/x-x509-ca-cert";

#[derive(Serialize)]
struct InfoResponse {
    ip: String,
    port: String,
}

/// Handlers for the `/api/*` routes, the root certificate download and the UI
pub struct AdminApi {
    ca: Arc<CertificateAuthority>,
    store: Arc<RuleStore>,
    traffic: Arc<TrafficLog>,
    ui_dir: PathBuf,
    port: u16,
}

impl AdminApi {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        store: Arc<RuleStore>,
        traffic: Arc<TrafficLog>,
        ui_dir: PathBuf,
        port: u16,
    ) -> Self {
        Self {
            ca,
            store,
            traffic,
            ui_dir,
            port,
        }
    }

    /// Route one management request; every response carries CORS headers
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        let mut response = match (&method, path.as_str()) {
            (&Method::OPTIONS, _) => Response::new(empty_body()),
            (&Method::GET, "/api/info") => self.info().await,
            (&Method::GET, "/api/traffic") => self.list_traffic(req.uri().query()),
            (&Method::POST, "/api/traffic/clear") => {
                self.traffic.clear();
                info!("[API] POST /api/traffic/clear - Traffic logs cleared");
                Response::new(empty_body())
            }
            (&Method::GET, "/api/config") => {
                json_response(&Config {
                    rules: self.store.snapshot().to_vec(),
                })
            }
            (&Method::POST, "/api/config") => self.set_config(req).await,
            (&Method::POST, "/api/ca/generate") => self.regenerate_ca().await,
            (&Method::GET, "/ca.crt") => {
                let mut response = Response::new(full_body(Bytes::from(self.ca.root_pem())));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(CA_CONTENT_TYPE));
                response
            }
            (&Method::GET, "/") => self.serve_file(Path::new("index.html")).await,
            (&Method::GET, p) if p.starts_with("/assets/") => {
                match safe_relative_path(&p["/".len()..]) {
                    Some(relative) => self.serve_file(&relative).await,
                    None => not_found(),
                }
            }
            _ => not_found(),
        };

        add_cors_headers(&mut response);
        response
    }

    async fn info(&self) -> Response<ProxyBody> {
        json_response(&InfoResponse {
            ip: local_ip().await.to_string(),
            port: self.port.to_string(),
        })
    }

    fn list_traffic(&self, query: Option<&str>) -> Response<ProxyBody> {
        let entries = self.traffic.entries();

        let silent = query
            .map(|q| q.split('&').any(|pair| pair == "silent=true"))
            .unwrap_or(false);
        if !silent {
            debug!("[API] GET /api/traffic - Returned {} logs", entries.len());
        }

        json_response(&entries)
    }

    async fn set_config<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let config: Config = match serde_json::from_slice(&body) {
            Ok(config) => config,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, &format!("Invalid config: {}", e)),
        };

        match self.store.replace(config.rules) {
            Ok(rules) => {
                info!("[API] POST /api/config - {} rule(s) saved", rules.len());
                json_response(&Config { rules })
            }
            Err(e @ ProxyError::InvalidRule(_)) => text_response(StatusCode::BAD_REQUEST, &e.to_string()),
            Err(e) => {
                error!("Failed to save rules: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }

    async fn regenerate_ca(&self) -> Response<ProxyBody> {
        let ca = self.ca.clone();
        let result = match tokio::task::spawn_blocking(move || ca.regenerate()).await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                info!("[API] POST /api/ca/generate - Root CA regenerated");
                Response::new(empty_body())
            }
            Err(e) => {
                error!("Failed to regenerate root CA: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }

    async fn serve_file(&self, relative: &Path) -> Response<ProxyBody> {
        let path = self.ui_dir.join(relative);

        match tokio::fs::read(&path).await {
            Ok(contents) => {
                let mut response = Response::new(full_body(Bytes::from(contents)));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(content_type_for(&path)));
                response
            }
            Err(e) => {
                debug!("UI file {} unavailable: {}", path.display(), e);
                not_found()
            }
        }
    }
}

fn json_response<T: Serialize>(value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(json) => {
            let mut response = Response::new(full_body(Bytes::from(json)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn not_found() -> Response<ProxyBody> {
    text_response(StatusCode::NOT_FOUND, "Not Found")
}

fn add_cors_headers(response: &mut Response<ProxyBody>) {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, OPTIONS, DELETE"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type"),
    );
}

/// Accept only plain relative paths (no `..`, no roots or prefixes)
fn safe_relative_path(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    if path.as_os_str().is_empty() || path.to_string_lossy().contains('\\') {
        return None;
    }

    path.components()
        .all(|component| matches!(component, Component::Normal(_)))
        .then(|| path.to_path_buf())
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Address of the outbound interface, falling back to loopback.
/// Connecting a UDP socket sends nothing; it only selects a route.
async fn local_ip() -> IpAddr {
    let fallback = IpAddr::from([127, 0, 0, 1]);

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(_) => return fallback,
    };
    if socket.connect("8.8.8.8:80").await.is_err() {
        return fallback;
    }

    match socket.local_addr() {
        Ok(addr) if addr.ip().is_ipv4() && !addr.ip().is_loopback() && !addr.ip().is_unspecified() => {
            addr.ip()
        }
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{MatchType, MockResponse, MockRule};
    use crate::traffic::TrafficRecord;
    use http_body_util::Full;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        api: AdminApi,
        ca: Arc<CertificateAuthority>,
        store: Arc<RuleStore>,
        traffic: Arc<TrafficLog>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let ui_dir = dir.path().join("dist");
        std::fs::create_dir_all(ui_dir.join("assets")).unwrap();
        std::fs::write(ui_dir.join("index.html"), "<html>ui</html>").unwrap();
        std::fs::write(ui_dir.join("assets").join("app.js"), "console.log(1)").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "secret").unwrap();

        let ca = Arc::new(CertificateAuthority::initialize(dir.path()).unwrap());
        let store = Arc::new(RuleStore::in_memory().unwrap());
        let traffic = Arc::new(TrafficLog::default());
        let api = AdminApi::new(ca.clone(), store.clone(), traffic.clone(), ui_dir, 9292);

        Fixture {
            _dir: dir,
            api,
            ca,
            store,
            traffic,
        }
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_options_and_cors() {
        let f = fixture();
        let response = f.api.handle(request(Method::OPTIONS, "/anything", "")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(
            response.headers()["access-control-allow-methods"],
            "GET, POST, OPTIONS, DELETE"
        );
    }

    #[tokio::test]
    async fn test_info() {
        let f = fixture();
        let response = f.api.handle(request(Method::GET, "/api/info", "")).await;
        let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();

        assert_eq!(value["port"], "9292");
        assert!(value["ip"].as_str().unwrap().parse::<IpAddr>().is_ok());
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let f = fixture();
        let json = r#"{"rules":[{"enabled":true,"name":"users","url":"https://api.test/users","matchType":"prefix","response":{"statusCode":200,"headers":{},"body":"[]","delay":0}}]}"#;

        let response = f.api.handle(request(Method::POST, "/api/config", json)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let snapshot = f.store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].id.is_empty());

        let response = f.api.handle(request(Method::GET, "/api/config", "")).await;
        let config: Config = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(config.rules[0].url_pattern, "https://api.test/users");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let f = fixture();
        f.store
            .replace(vec![MockRule {
                id: "keep".to_string(),
                enabled: true,
                name: "keep".to_string(),
                url_pattern: "/".to_string(),
                match_type: MatchType::Prefix,
                response: MockResponse {
                    status_code: 200,
                    headers: BTreeMap::new(),
                    body: String::new(),
                    delay_millis: 0,
                },
            }])
            .unwrap();

        let response = f.api.handle(request(Method::POST, "/api/config", "{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bad_match = r#"{"rules":[{"url":"/","matchType":"glob","response":{"statusCode":200}}]}"#;
        let response = f.api.handle(request(Method::POST, "/api/config", bad_match)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(f.store.snapshot()[0].id, "keep");
    }

    #[tokio::test]
    async fn test_traffic_list_and_clear() {
        let f = fixture();
        f.traffic.append(TrafficRecord::new(
            &Method::GET,
            "http://example.com/",
            StatusCode::OK,
            false,
            Duration::from_millis(1),
        ));

        let response = f.api.handle(request(Method::GET, "/api/traffic?silent=true", "")).await;
        let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
        assert_eq!(value[0]["url"], "http://example.com/");

        let response = f.api.handle(request(Method::POST, "/api/traffic/clear", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(f.traffic.is_empty());
    }

    #[tokio::test]
    async fn test_root_certificate_download_and_regenerate() {
        let f = fixture();
        let before = f.ca.root_pem();

        let response = f.api.handle(request(Method::GET, "/ca.crt", "")).await;
        assert_eq!(response.headers()[CONTENT_TYPE], CA_CONTENT_TYPE);
        assert_eq!(body_string(response).await, before);

        let response = f.api.handle(request(Method::POST, "/api/ca/generate", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_ne!(f.ca.root_pem(), before);
    }

    #[tokio::test]
    async fn test_static_files() {
        let f = fixture();

        let response = f.api.handle(request(Method::GET, "/", "")).await;
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(body_string(response).await, "<html>ui</html>");

        let response = f.api.handle(request(Method::GET, "/assets/app.js", "")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = f.api.handle(request(Method::GET, "/assets/../../secret.txt", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = f.api.handle(request(Method::GET, "/assets/missing.css", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let f = fixture();
        let response = f.api.handle(request(Method::DELETE, "/api/config", "")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "Not Found");
    }

    #[test]
    fn test_safe_relative_path() {
        assert!(safe_relative_path("assets/app.js").is_some());
        assert!(safe_relative_path("assets/../x").is_none());
        assert!(safe_relative_path("/etc/passwd").is_none());
        assert!(safe_relative_path("").is_none());
    }
}
