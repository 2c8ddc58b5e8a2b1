//! Bounded in-memory log of completed transactions, newest first

use chrono::{DateTime, Utc};
use hyper::{Method, StatusCode};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

/// Default number of records kept in the log
pub const DEFAULT_CAPACITY: usize = 500;

/// One completed request/response exchange
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRecord {
    pub id: String,
    pub time: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub status_code: u16,
    pub mocked: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

impl TrafficRecord {
    pub fn new(
        method: &Method,
        url: &str,
        status: StatusCode,
        mocked: bool,
        duration: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            time: Utc::now(),
            method: method.to_string(),
            url: url.to_string(),
            status_code: status.as_u16(),
            mocked,
            duration,
        }
    }
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:?}", duration))
}

pub struct TrafficLog {
    entries: Mutex<VecDeque<TrafficRecord>>,
    capacity: usize,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Insert at the head, dropping the oldest records beyond capacity
    pub fn append(&self, record: TrafficRecord) {
        let mut entries = self.entries.lock();
        entries.push_front(record);
        entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> Vec<TrafficRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TrafficLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
