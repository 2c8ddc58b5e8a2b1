//! Error types shared across the proxy

use thiserror::Error;

/// Errors raised by the proxy core
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("RSA key generation failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    #[error("Failed to encode private key: {0}")]
    KeyEncoding(#[from] rsa::pkcs8::Error),

    #[error("Invalid PEM data: {0}")]
    Pem(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Invalid server name: {0}")]
    ServerName(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
