use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::db::Database;
use crate::error::Result;
use crate::models::CacheEntry;

pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Cache key for a query: trimmed and lowercased.
pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

fn now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        normalized_query: row.get(0)?,
        original_query: row.get(1)?,
        command: row.get(2)?,
        run_count: row.get(3)?,
        last_used: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Natural-language query to command mappings, stored next to the history.
pub struct CommandCache<'a> {
    db: &'a Database,
}

impl<'a> CommandCache<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn lookup(&self, query: &str) -> Result<Option<CacheEntry>> {
        let normalized = normalize_query(query);

        let entry = self.db.conn.query_row(
            "SELECT normalized_query, original_query, command, run_count, last_used, created_at
             FROM wizard_cache WHERE normalized_query = ?",
            params![normalized],
            entry_from_row,
        ).optional()?;

        debug!("cache {} for {:?}", if entry.is_some() { "hit" } else { "miss" }, normalized);
        Ok(entry)
    }

    pub fn record(&self, query: &str, command: &str) -> Result<()> {
        self.record_at(query, command, now())
    }

    /// Insert the mapping, or bump `run_count` and replace the command of
    /// an existing one.
    pub fn record_at(&self, query: &str, command: &str, at: f64) -> Result<()> {
        let normalized = normalize_query(query);

        self.db.conn.execute(
            "INSERT INTO wizard_cache (normalized_query, original_query, command, run_count, last_used, created_at)
             VALUES (?, ?, ?, 1, ?, ?)
             ON CONFLICT(normalized_query) DO UPDATE SET
                 original_query = excluded.original_query,
                 command = excluded.command,
                 run_count = run_count + 1,
                 last_used = excluded.last_used",
            params![normalized, query.trim(), command, at, at],
        )?;

        Ok(())
    }

    /// Most recently used first.
    pub fn list(&self, limit: usize) -> Result<Vec<CacheEntry>> {
        let limit = if limit == 0 { DEFAULT_LIST_LIMIT } else { limit };

        let mut stmt = self.db.conn.prepare(
            "SELECT normalized_query, original_query, command, run_count, last_used, created_at
             FROM wizard_cache ORDER BY last_used DESC, rowid DESC LIMIT ?",
        )?;
        let entries = stmt.query_map(params![limit as i64], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Returns the number of removed entries.
    pub fn clear(&self) -> Result<usize> {
        Ok(self.db.conn.execute("DELETE FROM wizard_cache", [])?)
    }

    /// Returns whether an entry was removed.
    pub fn delete(&self, query: &str) -> Result<bool> {
        let removed = self.db.conn.execute(
            "DELETE FROM wizard_cache WHERE normalized_query = ?",
            params![normalize_query(query)],
        )?;
        Ok(removed > 0)
    }
}
