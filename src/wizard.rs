use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::CommandCache;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::keywords::extract_keywords;
use crate::llm::{GenerationError, Generator, DEFAULT_TIMEOUT};

/// Past commands sent along with a request.
pub const MAX_CONTEXT_COMMANDS: usize = 10;
/// Context commands longer than this many characters are cut.
pub const MAX_CONTEXT_CHARS: usize = 100;

const SYSTEM_PROMPT: &str = r#"You are a shell command generator. Convert natural language requests into executable shell commands.

RULES:
- Output ONLY the shell command, nothing else
- No explanations, no markdown, no code blocks
- Use common Unix/Linux commands
- Prefer simple, readable commands
- If multiple commands needed, chain with && or use subshells
- Use appropriate flags for human-readable output where applicable
- If the request is ambiguous, make reasonable assumptions

EXAMPLES:
User: "list all files including hidden"
Output: ls -la

User: "find large files over 100MB"
Output: find . -type f -size +100M

User: "show disk usage"
Output: df -h

User: "count lines in all python files"
Output: find . -name "*.py" -exec wc -l {} +"#;

#[derive(Debug, Clone, Default)]
pub struct WizardRequest {
    pub query: String,
    pub pwd: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Cache,
    Llm,
}

#[derive(Debug, Clone, Serialize)]
pub struct WizardResponse {
    pub command: String,
    pub source: Provenance,
    pub query: String,
    pub latency_ms: u128,
    pub from_cache: bool,
}

impl WizardResponse {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Turns natural-language requests into shell commands, answering from the
/// cache when it can.
pub struct Wizard<'a> {
    db: &'a Database,
    generator: Option<&'a dyn Generator>,
    timeout: Duration,
}

impl<'a> Wizard<'a> {
    pub fn new(db: &'a Database, generator: Option<&'a dyn Generator>) -> Self {
        Self {
            db,
            generator,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn generate(&self, req: &WizardRequest) -> Result<WizardResponse> {
        let start = Instant::now();

        let query = req.query.trim();
        if query.is_empty() {
            return Err(Error::EmptyQuery);
        }

        if let Some(cached) = CommandCache::new(self.db).lookup(query)? {
            return Ok(WizardResponse {
                command: cached.command,
                source: Provenance::Cache,
                query: query.to_string(),
                latency_ms: start.elapsed().as_millis(),
                from_cache: true,
            });
        }

        let generator = self.generator.ok_or(Error::NoGenerator)?;

        let context = self.gather_history_context(query)?;
        let prompt = build_user_prompt(query, req.pwd.as_deref(), &context);
        debug!("prompt with {} context commands", context.len());

        let response = generator.generate(&prompt, SYSTEM_PROMPT, self.timeout)?;
        let command = parse_response(&response);
        if command.is_empty() {
            return Err(GenerationError::EmptyResponse.into());
        }

        info!("generated command in {:?}", start.elapsed());
        Ok(WizardResponse {
            command,
            source: Provenance::Llm,
            query: query.to_string(),
            latency_ms: start.elapsed().as_millis(),
            from_cache: false,
        })
    }

    /// Called once the user actually ran `command` for `query`.
    pub fn confirm(&self, query: &str, command: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }
        CommandCache::new(self.db).record(query, command)
    }

    /// Commands matching the request's keywords, or the most recent
    /// commands when nothing matches.
    fn gather_history_context(&self, query: &str) -> Result<Vec<String>> {
        let keywords = extract_keywords(query);
        let mut results = if keywords.is_empty() {
            Vec::new()
        } else {
            self.db.search_by_keywords(&keywords, MAX_CONTEXT_COMMANDS)?
        };
        if results.is_empty() {
            results = self.db.recent(MAX_CONTEXT_COMMANDS)?;
        }
        Ok(results.into_iter().map(|r| r.text).collect())
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

pub fn build_user_prompt(query: &str, pwd: Option<&str>, context: &[String]) -> String {
    let mut prompt = String::from("Convert this request to a shell command:\n");
    prompt.push_str(query);
    prompt.push('\n');

    if let Some(pwd) = pwd.filter(|p| !p.is_empty()) {
        prompt.push_str("\nCurrent directory: ");
        prompt.push_str(pwd);
        prompt.push('\n');
    }

    if !context.is_empty() {
        prompt.push_str("\nRelevant commands from user's history (for context/patterns):\n");
        for cmd in context.iter().take(MAX_CONTEXT_COMMANDS) {
            prompt.push_str("- ");
            prompt.push_str(&truncate_chars(cmd, MAX_CONTEXT_CHARS));
            prompt.push('\n');
        }
    }

    prompt.push_str("\nShell command:");
    prompt
}

/// Clean up backend output: drop code fences and prompt markers, and keep
/// only the first line unless it continues onto the next.
pub fn parse_response(response: &str) -> String {
    let mut text = response.trim();

    for fence in ["```bash", "```shell", "```zsh", "```sh", "```"] {
        if let Some(rest) = text.strip_prefix(fence) {
            text = rest;
            break;
        }
    }
    let text = text.strip_suffix("```").unwrap_or(text).trim();

    let mut lines = text.lines();
    let first = lines.next().unwrap_or("").trim();
    let continues = first.ends_with('\\') || first.ends_with("&&") || first.ends_with('|');
    let text = if continues { text } else { first };

    let text = text
        .strip_prefix("$ ")
        .or_else(|| text.strip_prefix("# "))
        .unwrap_or(text);

    text.trim().to_string()
}
