use std::fs;
use std::path::PathBuf;

use dirs::home_dir;

use crate::error::{Error, Result};

pub const BEGIN_MARKER: &str = "# BEGIN zist integration";
pub const END_MARKER: &str = "# END zist integration";

pub const ZSH_INTEGRATION: &str = r#"# BEGIN zist integration
# Ctrl+X for fuzzy history search
_zist_search() {
  local buf=$LBUFFER
  local selected=$(zist search "$buf" 2>/dev/null)
  if [[ -n "$selected" ]]; then
    LBUFFER="$selected"
  fi
  zle reset-prompt
}
zle -N _zist_search
bindkey '^X' _zist_search

# Collect history after each command (subshell suppresses job notifications)
_zist_precmd() {
  (zist collect --quiet &)
}
autoload -Uz add-zsh-hook
add-zsh-hook precmd _zist_precmd
# END zist integration
"#;

pub fn zshrc_path() -> Result<PathBuf> {
    home_dir()
        .map(|home| home.join(".zshrc"))
        .ok_or_else(|| Error::Integration("could not determine home directory".into()))
}

/// `content` with the integration block appended, or `None` if it is
/// already there.
pub fn install_block(content: &str) -> Option<String> {
    if content.contains(BEGIN_MARKER) {
        return None;
    }

    let mut updated = content.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push('\n');
    updated.push_str(ZSH_INTEGRATION);
    Some(updated)
}

/// `content` without the integration block, or `None` if there is none.
pub fn remove_block(content: &str) -> Result<Option<String>> {
    let Some(mut begin) = content.find(BEGIN_MARKER) else {
        return Ok(None);
    };
    let mut end = content[begin..]
        .find(END_MARKER)
        .map(|idx| begin + idx + END_MARKER.len())
        .ok_or_else(|| Error::Integration(
            "found BEGIN marker but no END marker, remove the zist block manually".into()
        ))?;

    if content[end..].starts_with('\n') {
        end += 1;
    }
    if begin > 0 && content[..begin].ends_with('\n') {
        begin -= 1;
    }

    let mut updated = format!("{}{}", &content[..begin], &content[end..]);
    while updated.contains("\n\n\n") {
        updated = updated.replace("\n\n\n", "\n\n");
    }
    Ok(Some(updated))
}

/// Returns false when the block was already installed.
pub fn install() -> Result<bool> {
    let path = zshrc_path()?;
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(Error::io(&path, e)),
    };

    match install_block(&content) {
        Some(updated) => {
            fs::write(&path, updated).map_err(|e| Error::io(&path, e))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Returns false when there was nothing to remove.
pub fn uninstall() -> Result<bool> {
    let path = zshrc_path()?;
    let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;

    match remove_block(&content)? {
        Some(updated) => {
            fs::write(&path, updated).map_err(|e| Error::io(&path, e))?;
            Ok(true)
        }
        None => Ok(false),
    }
}
