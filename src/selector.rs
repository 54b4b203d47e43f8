use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use crate::error::{Error, Result};
use crate::history::format_timestamp;
use crate::models::SearchResult;

const PREVIEW: &str = r#"sh -c 'printf "Source: %s\nTime:   %s\n\nCommand:\n%s\n" "$2" "$3" "$1"' _ {..-3} {-2} {-1}"#;

/// NUL-terminated `command<TAB>origin<TAB>time` records, so multi-line
/// commands survive as one candidate.
pub fn encode_candidates(results: &[SearchResult]) -> Vec<u8> {
    let mut out = Vec::new();
    for result in results {
        out.extend_from_slice(result.text.as_bytes());
        out.push(b'\t');
        out.extend_from_slice(result.origin.as_bytes());
        out.push(b'\t');
        out.extend_from_slice(format_timestamp(result.timestamp).as_bytes());
        out.push(0);
    }
    out
}

/// The command field of a selection printed by fzf. Origin and time are the
/// last two fields, so tabs inside the command are kept.
pub fn decode_selection(output: &[u8]) -> Option<String> {
    let selected = String::from_utf8_lossy(output);
    let selected = selected.trim_end_matches('\0').trim();
    if selected.is_empty() {
        return None;
    }
    selected.rsplitn(3, '\t').last().map(str::to_string)
}

/// Let the user pick one result with fzf. `None` when cancelled.
pub fn select(results: &[SearchResult]) -> Result<Option<String>> {
    if results.is_empty() {
        return Ok(None);
    }

    let mut child = Command::new("fzf")
        .args([
            "--read0",
            "--print0",
            "--delimiter=\t",
            "--with-nth=..-3",
            "--preview",
            PREVIEW,
            "--preview-window=right:40%:wrap",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::SelectorMissing,
            _ => Error::Selector(e.to_string()),
        })?;

    let input = encode_candidates(results);
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Selector("stdin not captured".into()))?;
    // fzf may exit before reading everything, so a broken pipe is expected.
    let writer = thread::spawn(move || {
        let _ = stdin.write_all(&input);
    });

    let output = child
        .wait_with_output()
        .map_err(|e| Error::Selector(e.to_string()))?;
    let _ = writer.join();

    match output.status.code() {
        Some(0) => Ok(decode_selection(&output.stdout)),
        // 1: no match, 130: interrupted
        Some(1) | Some(130) => {
            debug!("selection cancelled");
            Ok(None)
        }
        code => Err(Error::Selector(format!("exited with {:?}", code))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_tab_separated_nul_terminated() {
        let results = vec![
            SearchResult { text: "ls -la".into(), origin: "/h/a".into(), timestamp: 0.0 },
            SearchResult { text: "echo 1\necho 2".into(), origin: "/h/b".into(), timestamp: 0.0 },
        ];
        let encoded = encode_candidates(&results);
        let records: Vec<&[u8]> = encoded.split(|b| *b == 0).collect();
        assert_eq!(records.len(), 3);
        assert!(records[2].is_empty());

        let first = String::from_utf8_lossy(records[0]);
        let fields: Vec<&str> = first.split('\t').collect();
        assert_eq!(fields[0], "ls -la");
        assert_eq!(fields[1], "/h/a");
        assert_eq!(fields[2], format_timestamp(0.0));
        assert!(String::from_utf8_lossy(records[1]).starts_with("echo 1\necho 2\t"));
    }

    #[test]
    fn keeps_tabs_inside_commands() {
        let results = vec![SearchResult {
            text: "printf 'a\tb'\tcut -f2".into(),
            origin: "/h".into(),
            timestamp: 0.0,
        }];
        let encoded = encode_candidates(&results);
        assert_eq!(decode_selection(&encoded).as_deref(), Some("printf 'a\tb'\tcut -f2"));
    }

    #[test]
    fn decodes_command_field() {
        assert_eq!(decode_selection(b"git status\t/h\t2024-01-01 00:00:00\0").as_deref(), Some("git status"));
        assert_eq!(decode_selection(b"echo 1\necho 2\t/h\tt\0").as_deref(), Some("echo 1\necho 2"));
        assert_eq!(decode_selection(b"\0"), None);
        assert_eq!(decode_selection(b"git status\0").as_deref(), Some("git status"));
        assert_eq!(decode_selection(b""), None);
    }
}
