use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::path::{Path, PathBuf};
use dirs::home_dir;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{CommandRecord, FrequentCommand, SearchResult, StoreStats};
use crate::query::SearchFilter;

const CURRENT_VERSION: i32 = 2;

/// Records per insert transaction.
pub const INSERT_BATCH_SIZE: usize = 500;

pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }

        let conn = Connection::open(path)?;
        debug!("opened database at {}", path.display());
        let mut db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn default_path() -> PathBuf {
        if let Some(home) = home_dir() {
            home.join(".zist").join("zist.db")
        } else {
            let uid = std::process::id();
            PathBuf::from(format!("/tmp/zist_{}.db", uid))
        }
    }

    fn init_schema(&mut self) -> Result<()> {
        let version: i32 = self.conn.query_row(
            "PRAGMA user_version",
            [],
            |row| row.get(0)
        )?;

        if version < 1 {
            self.create_initial_schema()?;
        }

        if version < 2 {
            self.migrate_to_v2()?;
        }

        if version < CURRENT_VERSION {
            info!("migrated database schema from v{} to v{}", version, CURRENT_VERSION);
        }

        Ok(())
    }

    fn create_initial_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN IMMEDIATE;

            CREATE TABLE IF NOT EXISTS commands (
                origin TEXT NOT NULL,
                timestamp REAL NOT NULL,
                text TEXT NOT NULL,
                duration INTEGER,
                cwd TEXT,
                exit_code INTEGER,
                PRIMARY KEY (origin, timestamp)
            );

            CREATE INDEX IF NOT EXISTS idx_timestamp ON commands(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_origin ON commands(origin);

            CREATE VIRTUAL TABLE IF NOT EXISTS commands_fts USING fts5(
                text,
                content='commands',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS commands_ai AFTER INSERT ON commands BEGIN
                INSERT INTO commands_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            CREATE TRIGGER IF NOT EXISTS commands_ad AFTER DELETE ON commands BEGIN
                INSERT INTO commands_fts(commands_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
            END;

            CREATE TRIGGER IF NOT EXISTS commands_au AFTER UPDATE ON commands BEGIN
                INSERT INTO commands_fts(commands_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
                INSERT INTO commands_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            PRAGMA user_version = 1;
            COMMIT;"
        )?;

        Ok(())
    }

    fn migrate_to_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN IMMEDIATE;

            CREATE TABLE IF NOT EXISTS wizard_cache (
                normalized_query TEXT PRIMARY KEY,
                original_query TEXT NOT NULL,
                command TEXT NOT NULL,
                run_count INTEGER NOT NULL DEFAULT 1,
                last_used REAL NOT NULL,
                created_at REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_wizard_last_used ON wizard_cache(last_used DESC);
            CREATE INDEX IF NOT EXISTS idx_wizard_run_count ON wizard_cache(run_count DESC);

            PRAGMA user_version = 2;
            COMMIT;"
        )?;

        Ok(())
    }

    /// Insert records in one transaction. Keys that already exist are
    /// skipped. Returns `(inserted, skipped)`.
    pub fn insert_commands(&mut self, records: &[CommandRecord]) -> rusqlite::Result<(usize, usize)> {
        if records.is_empty() {
            return Ok((0, 0));
        }

        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            // The FTS index follows through the triggers.
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO commands (origin, timestamp, text, duration, cwd, exit_code)
                 VALUES (?, ?, ?, ?, ?, ?)"
            )?;

            for record in records {
                inserted += stmt.execute(params![
                    record.origin,
                    record.timestamp,
                    record.text,
                    record.duration,
                    record.cwd,
                    record.exit_code,
                ])?;
            }
        }
        tx.commit()?;

        Ok((inserted, records.len() - inserted))
    }

    pub fn insert_batch(&mut self, records: &[CommandRecord]) -> Result<(usize, usize)> {
        self.insert_batch_sized(records, INSERT_BATCH_SIZE)
    }

    /// Insert in sub-batches of `batch_size`, each in its own transaction.
    /// A failing sub-batch is rolled back and stops the run; earlier
    /// sub-batches stay committed.
    pub fn insert_batch_sized(&mut self, records: &[CommandRecord], batch_size: usize) -> Result<(usize, usize)> {
        let batch_size = if batch_size == 0 { INSERT_BATCH_SIZE } else { batch_size };
        let mut total_inserted = 0;
        let mut total_skipped = 0;

        for (i, batch) in records.chunks(batch_size).enumerate() {
            let start = i * batch_size;
            let (inserted, skipped) = self.insert_commands(batch).map_err(|source| Error::Batch {
                start,
                end: start + batch.len() - 1,
                source,
            })?;
            total_inserted += inserted;
            total_skipped += skipped;
        }

        Ok((total_inserted, total_skipped))
    }

    /// Run a filtered search. Text matches rank by relevance first, then
    /// recency; everything else is most recent first.
    pub fn query(&self, filter: &SearchFilter) -> Result<Vec<SearchResult>> {
        let (sql, values) = filter.to_sql();
        debug!("search: {}", sql);

        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = values.iter()
            .map(|b| &**b as &dyn ToSql)
            .collect();

        let results = stmt.query_map(&param_refs[..], |row| {
            Ok(SearchResult {
                text: row.get(0)?,
                origin: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let total_records: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM commands",
            [],
            |row| row.get(0)
        )?;

        let distinct_origins: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT origin) FROM commands",
            [],
            |row| row.get(0)
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT origin, COUNT(*) AS count FROM commands
             GROUP BY origin ORDER BY count DESC, origin"
        )?;
        let per_origin = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(StoreStats {
            total_records,
            distinct_origins,
            per_origin,
        })
    }

    /// Commands containing the keywords: all of them if anything matches,
    /// otherwise any of them. Grouped by text, most frequent first.
    pub fn search_by_keywords(&self, keywords: &[String], limit: usize) -> Result<Vec<SearchResult>> {
        let filtered: Vec<String> = keywords.iter()
            .map(|kw| kw.trim())
            .filter(|kw| kw.chars().count() > 2)
            .map(|kw| format!("%{}%", escape_like(kw)))
            .collect();

        if filtered.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let results = self.keyword_query(&filtered, " AND ", limit)?;
        if !results.is_empty() || filtered.len() == 1 {
            return Ok(results);
        }

        self.keyword_query(&filtered, " OR ", limit)
    }

    fn keyword_query(&self, patterns: &[String], joiner: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let conditions = vec!["text LIKE ? ESCAPE '\\'"; patterns.len()].join(joiner);
        let sql = format!(
            "SELECT text, origin, MAX(timestamp) AS ts FROM commands
             WHERE {}
             GROUP BY text
             ORDER BY COUNT(*) DESC, ts DESC
             LIMIT ?",
            conditions
        );

        let mut values: Vec<Box<dyn ToSql>> = patterns.iter()
            .map(|p| Box::new(p.clone()) as Box<dyn ToSql>)
            .collect();
        values.push(Box::new(limit as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let results = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok(SearchResult {
                text: row.get(0)?,
                origin: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    pub fn search_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT text, origin, timestamp FROM commands
             WHERE text LIKE ? ESCAPE '\\'
             ORDER BY timestamp DESC
             LIMIT ?"
        )?;

        let pattern = format!("{}%", escape_like(prefix));
        let results = stmt.query_map(params![pattern, limit as i64], |row| {
            Ok(SearchResult {
                text: row.get(0)?,
                origin: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<SearchResult>> {
        self.query(&SearchFilter::new().limit(limit))
    }

    pub fn frequent(&self, pattern: Option<&str>, limit: usize) -> Result<Vec<FrequentCommand>> {
        let pattern = format!("%{}%", escape_like(pattern.unwrap_or("")));

        let mut stmt = self.conn.prepare(
            "SELECT text, COUNT(*) AS count FROM commands
             WHERE text LIKE ? ESCAPE '\\'
             GROUP BY text
             ORDER BY count DESC, MAX(timestamp) DESC
             LIMIT ?"
        )?;

        let results = stmt.query_map(params![pattern, limit as i64], |row| {
            Ok(FrequentCommand {
                text: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    pub fn get_command(&self, origin: &str, timestamp: f64) -> Result<Option<CommandRecord>> {
        let record = self.conn.query_row(
            "SELECT origin, timestamp, text, duration, cwd, exit_code
             FROM commands WHERE origin = ? AND timestamp = ?",
            params![origin, timestamp],
            |row| {
                Ok(CommandRecord {
                    origin: row.get(0)?,
                    timestamp: row.get(1)?,
                    text: row.get(2)?,
                    duration: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    cwd: row.get(4)?,
                    exit_code: row.get(5)?,
                })
            }
        ).optional()?;

        Ok(record)
    }

    /// Rebuild the full-text index from the commands table.
    pub fn rebuild_index(&self) -> Result<()> {
        self.conn.execute(
            "INSERT INTO commands_fts(commands_fts) VALUES ('rebuild')",
            []
        )?;
        info!("rebuilt full-text index");
        Ok(())
    }

    /// Fails when the full-text index disagrees with the commands table.
    pub fn check_index(&self) -> Result<()> {
        self.conn.execute(
            "INSERT INTO commands_fts(commands_fts, rank) VALUES ('integrity-check', 1)",
            []
        )?;
        Ok(())
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(origin: &str, timestamp: f64, text: &str) -> CommandRecord {
        CommandRecord {
            origin: origin.to_string(),
            timestamp,
            text: text.to_string(),
            duration: 0,
            cwd: None,
            exit_code: None,
        }
    }

    fn fts_count(db: &Database, term: &str) -> i64 {
        db.conn.query_row(
            "SELECT COUNT(*) FROM commands_fts WHERE commands_fts MATCH ?",
            [term],
            |row| row.get(0)
        ).unwrap()
    }

    #[test]
    fn open_creates_schema_at_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        let db = Database::open(&path).unwrap();
        let version: i32 = db.conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, CURRENT_VERSION);
        drop(db);

        // Reopening runs no migrations and keeps data.
        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().unwrap().total_records, 0);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        let records = vec![
            record("/file1", 1000.0, "ls"),
            record("/file1", 1000.001, "pwd"),
            record("/file2", 2000.0, "git status"),
        ];

        assert_eq!(db.insert_batch(&records).unwrap(), (3, 0));
        assert_eq!(db.insert_batch(&records).unwrap(), (0, 3));
        assert_eq!(db.stats().unwrap().total_records, 3);
    }

    #[test]
    fn sub_batches_add_up() {
        let mut db = Database::open_in_memory().unwrap();
        let records: Vec<_> = (0..25)
            .map(|i| record("/file", 1000.0 + f64::from(i) * 10.0, "test command"))
            .collect();

        assert_eq!(db.insert_batch_sized(&records, 10).unwrap(), (25, 0));
        assert_eq!(db.insert_batch_sized(&records[..12], 10).unwrap(), (0, 12));
    }

    #[test]
    fn failed_sub_batch_rolls_back_alone() {
        let mut db = Database::open_in_memory().unwrap();
        db.conn
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON commands
                 WHEN NEW.text = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let records: Vec<_> = (0..25)
            .map(|i| {
                let text = if i == 13 { "poison" } else { "test command" };
                record("/file", 1000.0 + f64::from(i), text)
            })
            .collect();

        let err = db.insert_batch_sized(&records, 10).unwrap_err();
        assert!(matches!(err, Error::Batch { start: 10, end: 19, .. }), "{}", err);

        let stored: Vec<f64> = db
            .conn
            .prepare("SELECT timestamp FROM commands ORDER BY timestamp")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        let expected: Vec<f64> = (0..10).map(|i| 1000.0 + f64::from(i)).collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn stats_count_per_origin() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_batch(&[
            record("/file1", 1000.0, "cmd1"),
            record("/file1", 1001.0, "cmd2"),
            record("/file2", 2000.0, "cmd3"),
        ]).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.distinct_origins, 2);
        assert_eq!(stats.per_origin, vec![("/file1".to_string(), 2), ("/file2".to_string(), 1)]);
    }

    #[test]
    fn multiline_text_round_trips() {
        let mut db = Database::open_in_memory().unwrap();
        let text = "cat > f << 'EOF'\nline 1\nEOF";
        db.insert_batch(&[record("/h", 5.0, text)]).unwrap();

        let stored = db.get_command("/h", 5.0).unwrap().unwrap();
        assert_eq!(stored.text, text);
        assert!(db.get_command("/h", 5.001).unwrap().is_none());
    }

    #[test]
    fn text_index_follows_base_table() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_batch(&[record("/h", 1.0, "docker ps"), record("/h", 2.0, "git status")]).unwrap();
        assert_eq!(fts_count(&db, "docker"), 1);

        db.conn.execute("UPDATE commands SET text = 'podman ps' WHERE timestamp = 1.0", []).unwrap();
        assert_eq!(fts_count(&db, "docker"), 0);
        assert_eq!(fts_count(&db, "podman"), 1);

        db.conn.execute("DELETE FROM commands WHERE timestamp = 2.0", []).unwrap();
        assert_eq!(fts_count(&db, "git"), 0);

        db.check_index().unwrap();
        db.rebuild_index().unwrap();
        assert_eq!(fts_count(&db, "podman"), 1);
    }

    #[test]
    fn keyword_search_falls_back_to_any() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_batch(&[
            record("/h", 1.0, "docker ps -a"),
            record("/h", 2.0, "docker ps -a"),
            record("/h", 3.0, "docker logs web"),
            record("/h", 4.0, "kubectl get pods"),
        ]).unwrap();

        let both = db.search_by_keywords(&["docker".into(), "logs".into()], 10).unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].text, "docker logs web");

        let any = db.search_by_keywords(&["docker".into(), "pods".into()], 10).unwrap();
        let texts: Vec<_> = any.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts[0], "docker ps -a");
        assert_eq!(texts.len(), 3);

        // Short keywords are ignored.
        assert!(db.search_by_keywords(&["ps".into()], 10).unwrap().is_empty());
    }

    #[test]
    fn like_wildcards_are_literal() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_batch(&[
            record("/h", 1.0, "echo 100%"),
            record("/h", 2.0, "echo 1000"),
            record("/h", 3.0, "my_script.sh"),
            record("/h", 4.0, "myxscript.sh"),
        ]).unwrap();

        let hits = db.search_by_prefix("echo 100%", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "echo 100%");

        let hits = db.search_by_keywords(&["my_script".into()], 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn recent_and_frequent() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_batch(&[
            record("/h", 1.0, "ls"),
            record("/h", 2.0, "ls"),
            record("/h", 3.0, "git status"),
        ]).unwrap();

        let recent = db.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "git status");

        let frequent = db.frequent(None, 10).unwrap();
        assert_eq!(frequent[0], FrequentCommand { text: "ls".into(), count: 2 });
        assert_eq!(db.frequent(Some("git"), 10).unwrap().len(), 1);
    }
}
