//! Rule store backed by SQLite
//! Persists the ordered mock rule list (list position is match priority)
//! and publishes every change as a new in-memory snapshot

use crate::error::{ProxyError, Result};
use crate::rules::{prepare_rules, MockResponse, MockRule, RuleSet};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const RULE_COLUMNS: &str =
    "id, enabled, name, url, match_type, status_code, headers, body, delay_ms";

/// Raw row as stored; decoded into a `MockRule` outside the SQLite callback
struct RuleRow {
    id: String,
    enabled: bool,
    name: String,
    url: String,
    match_type: String,
    status_code: u16,
    headers: String,
    body: String,
    delay_ms: i64,
}

impl RuleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            enabled: row.get(1)?,
            name: row.get(2)?,
            url: row.get(3)?,
            match_type: row.get(4)?,
            status_code: row.get(5)?,
            headers: row.get(6)?,
            body: row.get(7)?,
            delay_ms: row.get(8)?,
        })
    }

    fn into_rule(self) -> Result<MockRule> {
        let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)?;

        Ok(MockRule {
            id: self.id,
            enabled: self.enabled,
            name: self.name,
            url_pattern: self.url,
            match_type: self.match_type.parse()?,
            response: MockResponse {
                status_code: self.status_code,
                headers,
                body: self.body,
                delay_millis: self.delay_ms.max(0) as u64,
            },
        })
    }
}

/// Thread-safe store for the mock rule configuration
pub struct RuleStore {
    conn: Mutex<Connection>,
    db_path: String,
    rules: Arc<RuleSet>,
}

impl RuleStore {
    /// Open (or create) the rule database
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path_str,
            rules: Arc::new(RuleSet::default()),
        };

        store.initialize()?;
        info!("Loaded {} rule(s) from {}", store.snapshot().len(), store.db_path);

        Ok(store)
    }

    /// In-memory store, used by tests and throwaway sessions
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: ":memory:".to_string(),
            rules: Arc::new(RuleSet::default()),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                name TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL,
                match_type TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                headers TEXT NOT NULL DEFAULT '{}',
                body TEXT NOT NULL DEFAULT '',
                delay_ms INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rules_position ON rules(position)",
            [],
        )?;
        drop(conn);

        self.refresh()
    }

    /// Reload the in-memory snapshot from the database
    fn refresh(&self) -> Result<()> {
        let rules = self.load_rules()?;
        self.rules.replace(rules);
        Ok(())
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Shared snapshot holder, handed to the rule matcher
    pub fn rule_set(&self) -> Arc<RuleSet> {
        self.rules.clone()
    }

    /// Current rules in match order, without touching the database
    pub fn snapshot(&self) -> Arc<Vec<MockRule>> {
        self.rules.snapshot()
    }

    /// All rules in match order, read from the database
    pub fn load_rules(&self) -> Result<Vec<MockRule>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rules ORDER BY position",
            RULE_COLUMNS
        ))?;

        let rows = stmt
            .query_map([], RuleRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RuleRow::into_rule).collect()
    }

    pub fn get_rule(&self, id: &str) -> Result<Option<MockRule>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM rules WHERE id = ?1", RULE_COLUMNS),
                params![id],
                RuleRow::from_row,
            )
            .optional()?;

        row.map(RuleRow::into_rule).transpose()
    }

    /// Replace the whole rule list, keeping the given order.
    /// Returns the stored rules (with generated ids filled in).
    pub fn replace(&self, rules: Vec<MockRule>) -> Result<Vec<MockRule>> {
        let rules = prepare_rules(rules)?;
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            tx.execute("DELETE FROM rules", [])?;
            for (position, rule) in rules.iter().enumerate() {
                insert_rule(&tx, position as i64, rule)?;
            }

            tx.commit()?;
        }

        self.rules.replace(rules.clone());
        info!("Rule configuration replaced ({} rules)", rules.len());

        Ok(rules)
    }

    /// Append a rule at the lowest priority
    pub fn add(&self, rule: MockRule) -> Result<MockRule> {
        let mut prepared = prepare_rules(vec![rule])?;
        let rule = prepared.remove(0);
        {
            let conn = self.conn.lock();

            let next_position: i64 = conn.query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM rules",
                [],
                |row| row.get(0),
            )?;

            insert_rule(&conn, next_position, &rule)?;
        }
        self.refresh()?;

        Ok(rule)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .lock()
            .execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        self.refresh()?;
        Ok(affected > 0)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let affected = self.conn.lock().execute(
            "UPDATE rules SET enabled = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![enabled, id],
        )?;
        self.refresh()?;
        Ok(affected > 0)
    }
}

fn insert_rule(conn: &Connection, position: i64, rule: &MockRule) -> Result<()> {
    let headers = serde_json::to_string(&rule.response.headers)?;

    conn.execute(
        "INSERT INTO rules (id, position, enabled, name, url, match_type, status_code, headers, body, delay_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            rule.id,
            position,
            rule.enabled,
            rule.name,
            rule.url_pattern,
            rule.match_type.as_str(),
            rule.response.status_code,
            headers,
            rule.response.body,
            i64::try_from(rule.response.delay_millis)
                .map_err(|_| ProxyError::InvalidRule("delay out of range".to_string()))?,
        ],
    )?;

    Ok(())
}
