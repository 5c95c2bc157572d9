//! Configuration file loading with environment variable expansion
//!
//! Placeholders of the form `${ENV_VAR:default}` anywhere in the file are
//! replaced before the TOML is parsed. A missing variable without a default
//! expands to the empty string.

use regex::{Captures, Regex};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use super::ConfigError;

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").ok())
        .as_ref()
}

/// Expand `${ENV_VAR:default}` placeholders in a string
pub fn expand_env(content: &str) -> String {
    let re = match placeholder() {
        Some(re) if content.contains("${") => re,
        _ => return content.to_string(),
    };

    re.replace_all(content, |cap: &Captures<'_>| {
        let default_value = cap.get(2).map(|m| m.as_str()).unwrap_or("");
        env::var(&cap[1]).unwrap_or_else(|_| default_value.to_string())
    })
    .into_owned()
}

/// Read a configuration file and expand its placeholders
pub fn read_expanded<P: AsRef<Path>>(path: P) -> Result<String, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(expand_env(&content))
}
