#![forbid(unsafe_code)]

//! Runtime configuration for the tubegrab server.
//!
//! Values are resolved in precedence order: explicit overrides (CLI flags),
//! then real environment variables, then a `.env` file next to the binary,
//! then built-in defaults. Everything the server and the downloader need is
//! materialized once into [`RuntimeSettings`] and injected from there; no
//! module reads the environment on its own afterwards.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_OUTPUT_DIR: &str = "downloads";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub output_dir: PathBuf,
    pub port: u16,
    pub host: String,
    pub ytdlp_bin: PathBuf,
    /// Raw Netscape cookie text from the `COOKIE` variable, if provided.
    /// The downloader materializes it into a temp file on demand.
    pub cookie_text: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub output_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings(&file_vars, env_var_string, overrides))
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let output_dir = overrides
        .output_dir
        .or_else(|| lookup_value("OUTPUT_DIR", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEGRAB_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup_value("TUBEGRAB_HOST", file_vars, &env_lookup))
        .and_then(non_blank)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup_value("YTDLP_BIN", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let cookie_text = lookup_value("COOKIE", file_vars, &env_lookup).and_then(non_blank);

    RuntimeSettings {
        output_dir,
        port,
        host,
        ytdlp_bin,
        cookie_text,
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a `.env` file into key/value pairs. Missing file means no vars.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        if let Some((key, value)) = parse_env_line(line) {
            vars.insert(key, value);
        }
    }
    Ok(vars)
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, value_raw) = assignment.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value_raw.trim();
    let value = strip_matching_quotes(value, '"')
        .or_else(|| strip_matching_quotes(value, '\''))
        .unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}

fn strip_matching_quotes(value: &str, quote: char) -> Option<&str> {
    value
        .strip_prefix(quote)
        .and_then(|inner| inner.strip_suffix(quote))
}
