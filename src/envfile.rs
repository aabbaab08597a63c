//! Host environment file loading and `${VAR}` placeholder resolution.
//!
//! Compose manifests reference images through `${VAR}` or `${VAR:-default}`
//! placeholders resolved against a dotenv-style file next to the manifests.
//! Resolution is intentionally shallow: at most the first placeholder of a
//! string is substituted, with no recursion.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

/// Key/value mapping loaded from a dotenv-style environment file.
#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    vars: HashMap<String, String>,
}

impl EnvFile {
    /// Load an environment file.
    ///
    /// A missing or unreadable file is not an error; placeholders then
    /// resolve to their defaults (or the empty string).
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self {
                vars: parse(&content),
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Environment file not loaded");
                Self::default()
            }
        }
    }

    /// Build a mapping from explicit pairs.
    pub fn from_vars<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Resolve the first `${NAME}` / `${NAME:-default}` placeholder of
    /// `input` against the mapping.
    ///
    /// A present, non-empty value wins over the default; an absent or empty
    /// value falls back to the literal default, or the empty string when no
    /// default was supplied. Strings without a placeholder are returned
    /// unchanged.
    pub fn resolve(&self, input: &str) -> String {
        let Some(start) = input.find("${") else {
            return input.to_string();
        };
        let Some(end) = input[start..].find('}').map(|i| start + i) else {
            return input.to_string();
        };

        let inner = &input[start + 2..end];
        let (key, default) = match inner.split_once(":-") {
            Some((key, default)) => (key, Some(default)),
            None => (inner, None),
        };

        let value = self
            .vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .or(default)
            .unwrap_or("");

        format!("{}{}{}", &input[..start], value, &input[end + 1..])
    }
}

fn parse(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }

    vars
}
