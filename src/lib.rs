//! MockProxy - A local intercepting HTTP/HTTPS proxy
//!
//! Provides:
//! - On-demand leaf certificates signed by a locally generated root CA
//! - CONNECT tunnel interception with TLS termination and WebSocket relay
//! - First-match mock rules with optional response delay
//! - Bounded traffic log and a loopback management API

pub mod admin;
pub mod certificate;
pub mod database;
pub mod error;
pub mod forwarder;
pub mod proxy;
pub mod rules;
pub mod traffic;
pub mod tunnel;
pub mod wire;

pub use admin::AdminApi;
pub use certificate::{CertificateAuthority, LeafCertificate, RootCredential};
pub use database::RuleStore;
pub use error::{ProxyError, Result};
pub use forwarder::Forwarder;
pub use proxy::{ProxyConfig, ProxyServer};
pub use rules::{Config, MatchType, MockResponse, MockRule, RuleMatcher, RuleSet};
pub use traffic::{TrafficLog, TrafficRecord};
pub use tunnel::MitmTunnel;
