use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::{ConflictPolicy, EngineOptions};
use crate::limits::MAX_OCCURRENCES_PER_SERIES;

/// Server settings, read from `TUTORSCHED_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Concurrent in-flight HTTP requests.
    pub max_connections: usize,
    /// WAL appends before the compactor rewrites a tenant's log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub max_occurrences: usize,
    pub buffer_blocks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            max_occurrences: MAX_OCCURRENCES_PER_SERIES,
            buffer_blocks: false,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            bind: get("TUTORSCHED_BIND").unwrap_or(defaults.bind),
            port: parsed(&get, "TUTORSCHED_PORT").unwrap_or(defaults.port),
            data_dir: get("TUTORSCHED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parsed(&get, "TUTORSCHED_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&get, "TUTORSCHED_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&get, "TUTORSCHED_METRICS_PORT"),
            max_occurrences: parsed(&get, "TUTORSCHED_MAX_OCCURRENCES")
                .map(|n: usize| n.clamp(1, MAX_OCCURRENCES_PER_SERIES))
                .unwrap_or(defaults.max_occurrences),
            buffer_blocks: get("TUTORSCHED_BUFFER_BLOCKS")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.buffer_blocks),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            policy: ConflictPolicy {
                buffer_blocks: self.buffer_blocks,
            },
            max_occurrences: self.max_occurrences,
        }
    }
}
