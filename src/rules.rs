//! Mock rules and the first-match rule matcher

use crate::error::{ProxyError, Result};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// How a rule's URL pattern is compared against a request URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Prefix,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Prefix => "prefix",
            MatchType::Regex => "regex",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(MatchType::Exact),
            "prefix" => Ok(MatchType::Prefix),
            "regex" => Ok(MatchType::Regex),
            other => Err(ProxyError::InvalidRule(format!("unknown match type '{}'", other))),
        }
    }
}

/// Response synthesized when a rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    /// Artificial delay before responding, in milliseconds
    #[serde(default, rename = "delay")]
    pub delay_millis: u64,
}

impl MockResponse {
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK)
    }

    /// Configured headers, skipping entries that are not valid HTTP headers
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => debug!("Skipping invalid mock header {}: {}", name, value),
            }
        }
        map
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_millis)
    }
}

/// A pattern-to-response substitution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "url")]
    pub url_pattern: String,
    pub match_type: MatchType,
    pub response: MockResponse,
}

impl MockRule {
    /// Whether the pattern matches `url`, ignoring the enabled flag.
    /// Malformed regular expressions never match.
    pub fn matches(&self, url: &str) -> bool {
        match self.match_type {
            MatchType::Exact => url == self.url_pattern,
            MatchType::Prefix => url.starts_with(&self.url_pattern),
            MatchType::Regex => match Regex::new(&self.url_pattern) {
                Ok(re) => re.is_match(url),
                Err(e) => {
                    debug!(rule = %self.name, "Invalid regex pattern: {}", e);
                    false
                }
            },
        }
    }

    /// Suspend the current task for the rule's configured delay
    pub async fn apply_delay(&self) {
        if self.response.delay_millis > 0 {
            info!(
                "Applying delay {}ms for rule '{}'",
                self.response.delay_millis, self.name
            );
            tokio::time::sleep(self.response.delay()).await;
        }
    }
}

/// Rule configuration as exchanged with the management API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rules: Vec<MockRule>,
}

/// Assign ids to rules that lack one and reject unusable entries
pub fn prepare_rules(rules: Vec<MockRule>) -> Result<Vec<MockRule>> {
    let mut seen = HashSet::new();

    rules
        .into_iter()
        .map(|mut rule| {
            if rule.id.trim().is_empty() {
                rule.id = Uuid::new_v4().to_string();
            }
            if !seen.insert(rule.id.clone()) {
                return Err(ProxyError::InvalidRule(format!("duplicate rule id '{}'", rule.id)));
            }
            if StatusCode::from_u16(rule.response.status_code).is_err() {
                return Err(ProxyError::InvalidRule(format!(
                    "rule '{}' has invalid status code {}",
                    rule.name, rule.response.status_code
                )));
            }
            Ok(rule)
        })
        .collect()
}

/// Current rule list, replaced wholesale and read as immutable snapshots
pub struct RuleSet {
    rules: RwLock<Arc<Vec<MockRule>>>,
}

impl RuleSet {
    pub fn new(rules: Vec<MockRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<MockRule>> {
        self.rules.read().clone()
    }

    pub fn replace(&self, rules: Vec<MockRule>) {
        *self.rules.write() = Arc::new(rules);
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Finds the first enabled rule matching a request URL
#[derive(Clone)]
pub struct RuleMatcher {
    rules: Arc<RuleSet>,
}

impl RuleMatcher {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn find_match(&self, url: &str) -> Option<MockRule> {
        let snapshot = self.rules.snapshot();
        snapshot
            .iter()
            .find(|rule| rule.enabled && rule.matches(url))
            .cloned()
    }
}
