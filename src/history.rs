use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::{CommandRecord, RawRecord};

/// Offset added per repeated second. Only 1000 same-second commands fit
/// before the fraction reaches the next second.
pub const SUBSECOND_STEP: f64 = 0.001;

/// Files inside a directory are picked up when their name ends with this.
pub const HISTORY_FILE_SUFFIX: &str = "zsh_history";

/// Parse the header of an extended history line:
/// `: <seconds>:<duration>;<command>`.
fn parse_header(line: &str) -> Option<(i64, i64, &str)> {
    let rest = line.strip_prefix(": ")?;
    let (meta, command) = rest.split_once(';')?;
    let (seconds, duration) = meta.split_once(':')?;
    let seconds = seconds.trim().parse::<i64>().ok()?;
    let duration = duration.trim().parse::<i64>().ok()?;
    Some((seconds, duration, command))
}

struct OpenCommand {
    seconds: i64,
    duration: i64,
    text: String,
}

impl OpenCommand {
    fn finish(self, out: &mut Vec<RawRecord>) {
        let text = self.text.trim();
        if !text.is_empty() {
            out.push(RawRecord {
                seconds: self.seconds,
                duration: self.duration,
                text: text.to_string(),
            });
        }
    }
}

/// Split the contents of one history file into raw records, in file order.
///
/// Lines that don't start a new entry are appended to the open one. A
/// malformed header counts as such a line; before the first entry it is
/// dropped.
pub fn parse_history(content: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();
    let mut current: Option<OpenCommand> = None;

    for line in content.lines() {
        if let Some((seconds, duration, command)) = parse_header(line) {
            if let Some(open) = current.take() {
                open.finish(&mut records);
            }
            current = Some(OpenCommand {
                seconds,
                duration,
                text: command.to_string(),
            });
            continue;
        }

        match current.as_mut() {
            Some(open) => {
                open.text.push('\n');
                open.text.push_str(line);
            }
            None => {
                if !line.trim().is_empty() {
                    debug!("dropping line outside of any command: {:?}", line);
                }
            }
        }
    }

    if let Some(open) = current {
        open.finish(&mut records);
    }

    records
}

/// Turn raw records into keyed records. The k-th command (zero-based) seen
/// in a given second gets `seconds + k * 0.001`.
pub fn disambiguate(origin: &str, raw: Vec<RawRecord>) -> Vec<CommandRecord> {
    let mut seen: HashMap<i64, u32> = HashMap::new();

    raw.into_iter()
        .map(|record| {
            let index = seen.entry(record.seconds).or_insert(0);
            let timestamp = record.seconds as f64 + f64::from(*index) * SUBSECOND_STEP;
            *index += 1;

            CommandRecord {
                origin: origin.to_string(),
                timestamp,
                text: record.text,
                duration: record.duration,
                cwd: None,
                exit_code: None,
            }
        })
        .collect()
}

/// Read and parse one history file. The absolute path becomes the origin.
pub fn parse_history_file(path: &Path) -> Result<Vec<CommandRecord>> {
    let abs_path = std::path::absolute(path).map_err(|e| Error::io(path, e))?;
    let bytes = fs::read(&abs_path).map_err(|e| Error::io(&abs_path, e))?;
    let content = String::from_utf8_lossy(&bytes);

    let raw = parse_history(&content);
    Ok(disambiguate(&abs_path.to_string_lossy(), raw))
}

/// Expand the given paths into history files. Directories are walked
/// recursively. Paths that can't be read are returned separately.
pub fn expand_history_paths(paths: &[PathBuf]) -> (Vec<PathBuf>, Vec<Error>) {
    let mut files = Vec::new();
    let mut failures = Vec::new();

    for path in paths {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => walk_dir(path, &mut files, &mut failures),
            Ok(_) => files.push(path.clone()),
            Err(e) => failures.push(Error::io(path, e)),
        }
    }

    (files, failures)
}

fn walk_dir(dir: &Path, files: &mut Vec<PathBuf>, failures: &mut Vec<Error>) {
    // Symlinks are not followed, so a link back into the tree can't list
    // the same file under several origins.
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                failures.push(Error::Walk(e));
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(HISTORY_FILE_SUFFIX) {
            files.push(entry.into_path());
        }
    }
}

/// Format a stored timestamp as local `YYYY-MM-DD HH:MM:SS`.
pub fn format_timestamp(ts: f64) -> String {
    let secs = ts.trunc() as i64;
    let nanos = ((ts - ts.trunc()) * 1e9) as u32;
    match Local.timestamp_opt(secs, nanos).earliest() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::from("????-??-?? ??:??:??"),
    }
}
