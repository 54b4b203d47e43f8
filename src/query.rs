//! Search filters over the command store.
//!
//! A [`SearchFilter`] is a list of typed predicates plus a result limit. It
//! renders to one parameterized statement: user input only ever travels as
//! bound values.

use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use rusqlite::ToSql;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::SearchResult;

pub const DEFAULT_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every term must match as a prefix of some indexed token.
    TextMatch(String),
    /// `timestamp >= value`
    Since(f64),
    /// `timestamp <= value`
    Until(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchFilter {
    predicates: Vec<Predicate>,
    limit: usize,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchFilter {
    pub fn new() -> Self {
        Self {
            predicates: Vec::new(),
            limit: DEFAULT_LIMIT,
        }
    }

    /// Adds a text predicate. Queries with no usable terms add nothing.
    pub fn text(mut self, query: &str) -> Self {
        if let Some(expr) = build_match_expression(query) {
            self.predicates.push(Predicate::TextMatch(expr));
        }
        self
    }

    pub fn since(mut self, ts: f64) -> Self {
        self.predicates.push(Predicate::Since(ts));
        self
    }

    pub fn until(mut self, ts: f64) -> Self {
        self.predicates.push(Predicate::Until(ts));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn get_limit(&self) -> usize {
        self.limit
    }

    fn has_text(&self) -> bool {
        self.predicates.iter().any(|p| matches!(p, Predicate::TextMatch(_)))
    }

    pub(crate) fn to_sql(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut sql = if self.has_text() {
            String::from(
                "SELECT c.text, c.origin, c.timestamp FROM commands c
                 JOIN commands_fts f ON f.rowid = c.rowid
                 WHERE 1=1",
            )
        } else {
            String::from("SELECT c.text, c.origin, c.timestamp FROM commands c WHERE 1=1")
        };
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        for predicate in &self.predicates {
            match predicate {
                Predicate::TextMatch(expr) => {
                    sql.push_str(" AND commands_fts MATCH ?");
                    values.push(Box::new(expr.clone()));
                }
                Predicate::Since(ts) => {
                    sql.push_str(" AND c.timestamp >= ?");
                    values.push(Box::new(*ts));
                }
                Predicate::Until(ts) => {
                    sql.push_str(" AND c.timestamp <= ?");
                    values.push(Box::new(*ts));
                }
            }
        }

        // bm25() is lower for better matches.
        if self.has_text() {
            sql.push_str(" ORDER BY bm25(commands_fts) ASC, c.timestamp DESC LIMIT ?");
        } else {
            sql.push_str(" ORDER BY c.timestamp DESC LIMIT ?");
        }
        values.push(Box::new(self.limit as i64));

        (sql, values)
    }
}

/// Build an FTS5 expression where each whitespace-separated term is a
/// quoted prefix query. Terms without any letter or digit are dropped since
/// the tokenizer would index nothing for them.
pub fn build_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Parse `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD` (start of day) in local time.
pub fn parse_datetime(s: &str) -> Result<f64> {
    let s = s.trim();

    let naive = if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        dt
    } else if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        date.and_hms_opt(0, 0, 0)
            .ok_or_else(|| Error::InvalidDate(s.to_string()))?
    } else {
        return Err(Error::InvalidDate(s.to_string()));
    };

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp() as f64)
        .ok_or_else(|| Error::InvalidDate(s.to_string()))
}

/// Search parameters as they arrive from the command line.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: usize,
}

impl SearchRequest {
    pub fn to_filter(&self) -> Result<SearchFilter> {
        let mut filter = SearchFilter::new().limit(self.limit);

        if let Some(query) = self.query.as_deref().filter(|q| !q.trim().is_empty()) {
            filter = filter.text(query);
        }
        if let Some(since) = self.since.as_deref().filter(|s| !s.trim().is_empty()) {
            filter = filter.since(parse_datetime(since)?);
        }
        if let Some(until) = self.until.as_deref().filter(|s| !s.trim().is_empty()) {
            filter = filter.until(parse_datetime(until)?);
        }

        Ok(filter)
    }
}

pub struct QueryEngine<'a> {
    db: &'a Database,
}

impl<'a> QueryEngine<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        let filter = request.to_filter()?;
        self.db.query(&filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandRecord;

    fn db_with(records: &[(f64, &str)]) -> Database {
        let mut db = Database::open_in_memory().unwrap();
        let records: Vec<_> = records
            .iter()
            .map(|(ts, text)| CommandRecord {
                origin: "/h".into(),
                timestamp: *ts,
                text: text.to_string(),
                duration: 0,
                cwd: None,
                exit_code: None,
            })
            .collect();
        db.insert_batch(&records).unwrap();
        db
    }

    fn texts(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.text.as_str()).collect()
    }

    #[test]
    fn match_expression_quotes_prefix_terms() {
        assert_eq!(build_match_expression("git com").as_deref(), Some("\"git\"* \"com\"*"));
        assert_eq!(build_match_expression("say \"hi\"").as_deref(), Some("\"say\"* \"\"\"hi\"\"\"*"));
        assert_eq!(build_match_expression("  -- | "), None);
        assert_eq!(build_match_expression(""), None);
    }

    #[test]
    fn filter_composes_predicates_in_order() {
        let filter = SearchFilter::new().text("git").since(10.0).until(20.0).limit(5);
        assert_eq!(
            filter.predicates(),
            &[
                Predicate::TextMatch("\"git\"*".into()),
                Predicate::Since(10.0),
                Predicate::Until(20.0),
            ]
        );
        let (sql, values) = filter.to_sql();
        assert!(sql.contains("MATCH ?"));
        assert!(sql.contains("c.timestamp >= ?"));
        assert!(sql.contains("c.timestamp <= ?"));
        assert!(!sql.contains("git"));
        assert_eq!(values.len(), 4);
        assert_eq!(SearchFilter::new().limit(0).get_limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn text_search_ranks_matches_and_excludes_others() {
        let db = db_with(&[(1.0, "git status"), (2.0, "git commit"), (3.0, "echo hi")]);
        let results = db.query(&SearchFilter::new().text("git")).unwrap();
        assert_eq!(texts(&results), vec!["git commit", "git status"]);
    }

    #[test]
    fn better_matches_rank_first() {
        let db = db_with(&[
            (1.0, "git log --oneline"),
            (2.0, "echo git is a tool for tracking many changes in a repository over time"),
        ]);
        let results = db.query(&SearchFilter::new().text("git")).unwrap();
        assert_eq!(results[0].text, "git log --oneline");
    }

    #[test]
    fn terms_are_conjunctive_prefixes() {
        let db = db_with(&[(1.0, "docker compose up"), (2.0, "docker ps"), (3.0, "compose.yaml")]);
        let results = db.query(&SearchFilter::new().text("dock comp")).unwrap();
        assert_eq!(texts(&results), vec!["docker compose up"]);
    }

    #[test]
    fn no_text_orders_by_recency_with_limit() {
        let db = db_with(&[(1.0, "a"), (3.0, "c"), (2.0, "b")]);
        let results = db.query(&SearchFilter::new().limit(2)).unwrap();
        assert_eq!(texts(&results), vec!["c", "b"]);
    }

    #[test]
    fn parses_dates_and_datetimes() {
        let day = parse_datetime("2024-01-01").unwrap();
        let later = parse_datetime("2024-01-01 10:30:00").unwrap();
        assert_eq!(later - day, 10.0 * 3600.0 + 30.0 * 60.0);
        assert!(matches!(parse_datetime("01/01/2024"), Err(Error::InvalidDate(_))));
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let start = parse_datetime("2024-01-01").unwrap();
        let end = parse_datetime("2024-01-02").unwrap();
        let db = db_with(&[
            (start - 1.0, "before"),
            (start, "at start"),
            (start + 3600.0, "inside"),
            (end, "at end"),
            (end + 0.001, "after"),
        ]);

        let engine = QueryEngine::new(&db);
        let results = engine
            .search(&SearchRequest {
                query: None,
                since: Some("2024-01-01".into()),
                until: Some("2024-01-02".into()),
                limit: 0,
            })
            .unwrap();
        assert_eq!(texts(&results), vec!["at end", "inside", "at start"]);
    }

    #[test]
    fn request_combines_text_and_time() {
        let db = db_with(&[(10.0, "make test"), (20.0, "make build"), (30.0, "cargo test")]);
        let filter = SearchRequest {
            query: Some("make".into()),
            ..Default::default()
        }
        .to_filter()
        .unwrap()
        .until(15.0);
        let results = db.query(&filter).unwrap();
        assert_eq!(texts(&results), vec!["make test"]);
    }
}
