//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::{GatewayConfig, PATH_PLACEHOLDER};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a JSON or TOML file.
///
/// The format is chosen by extension: `.toml` is TOML, anything else JSON.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let raw = fs::read_to_string(path)?;
    let content = substitute_env(&raw, |name| std::env::var(name).ok());

    let config: GatewayConfig = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("toml") => toml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };

    validate_config(&config).map_err(ConfigError::Validation)?;

    tracing::debug!(path = ?path, vhosts = config.vhosts.len(), "Configuration loaded");
    Ok(config)
}

/// Expand `$NAME` and `${NAME}` using `lookup` (unset expands to nothing).
///
/// `${path}` is left in place for dispatch time and `$$` yields `$`. A `$`
/// not followed by a name is kept as is.
pub fn substitute_env<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        rest = &rest[at..];

        if rest.starts_with(PATH_PLACEHOLDER) {
            out.push_str(PATH_PLACEHOLDER);
            rest = &rest[PATH_PLACEHOLDER.len()..];
            continue;
        }
        if let Some(after) = rest.strip_prefix("$$") {
            out.push('$');
            rest = after;
            continue;
        }
        if let Some(braced) = rest.strip_prefix("${") {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                if is_name(name) {
                    out.push_str(&lookup(name).unwrap_or_default());
                    rest = &braced[end + 1..];
                    continue;
                }
            }
            out.push('$');
            rest = &rest[1..];
            continue;
        }

        let bare = &rest[1..];
        let len = bare
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(bare.len());
        let name = &bare[..len];
        if is_name(name) {
            out.push_str(&lookup(name).unwrap_or_default());
            rest = &bare[len..];
        } else {
            out.push('$');
            rest = bare;
        }
    }

    out.push_str(rest);
    out
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
