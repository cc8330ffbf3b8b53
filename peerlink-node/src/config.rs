//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use peerlink_core::{effective_chunk_size, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Node configuration. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_NAME, PEERLINK_PORT, PEERLINK_DOWNLOAD_DIR, PEERLINK_CHUNK_SIZE.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Login name; the command line may override it.
    #[serde(default)]
    pub name: Option<String>,
    /// TCP port to listen on (default 47800).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where `/save` writes received files (default: current directory).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Outbound chunk size in bytes (default 64 KiB, at most `MAX_CHUNK_SIZE`).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default)]
    pub media: MediaConfig,
}

/// Which simulated capture devices exist.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaConfig {
    #[serde(default = "yes")]
    pub audio: bool,
    #[serde(default = "yes")]
    pub video: bool,
}

fn default_port() -> u16 {
    47800
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn yes() -> bool {
    true
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            port: default_port(),
            download_dir: default_download_dir(),
            chunk_size: default_chunk_size(),
            media: MediaConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    sanitize(&mut c);
    c
}

/// Bring out-of-range values back to something the node can run with.
fn sanitize(c: &mut Config) {
    let chunk_size = effective_chunk_size(c.chunk_size);
    if chunk_size != c.chunk_size {
        tracing::warn!(
            configured = c.chunk_size,
            used = chunk_size,
            max = MAX_CHUNK_SIZE,
            "chunk_size out of range"
        );
        c.chunk_size = chunk_size;
    }
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PEERLINK_NAME") {
        c.name = Some(s);
    }
    if let Some(s) = var("PEERLINK_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("PEERLINK_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
    if let Some(s) = var("PEERLINK_CHUNK_SIZE") {
        if let Ok(n) = s.parse::<u64>() {
            c.chunk_size = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config, using defaults"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config, using defaults"),
            }
            break;
        }
    }
    None
}
