use serde::Serialize;

/// One command entry as read from a history file, before disambiguation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub seconds: i64,
    pub duration: i64,
    pub text: String,
}

/// A stored command. `(origin, timestamp)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub origin: String,
    pub timestamp: f64,
    pub text: String,
    pub duration: i64,
    pub cwd: Option<String>,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub text: String,
    pub origin: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrequentCommand {
    pub text: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StoreStats {
    pub total_records: i64,
    pub distinct_origins: i64,
    /// Record count per origin, largest first.
    pub per_origin: Vec<(String, i64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub normalized_query: String,
    pub original_query: String,
    pub command: String,
    pub run_count: i64,
    pub last_used: f64,
    pub created_at: f64,
}
