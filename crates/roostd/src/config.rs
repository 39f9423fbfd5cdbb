// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::ring;

/// Session supervisor daemon for AI coding agent terminals.
#[derive(Debug, Clone, Parser)]
#[command(name = "roostd", version, about)]
pub struct Config {
    /// State directory holding the control socket, pid-file, and daemon log.
    #[arg(long, env = "ROOSTD_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Replay ring capacity per session, in bytes.
    #[arg(long, env = "ROOSTD_RING_CAPACITY", default_value_t = ring::DEFAULT_CAPACITY)]
    pub ring_capacity: usize,

    /// Run attached to the terminal instead of as a detached daemon.
    #[arg(long)]
    pub foreground: bool,

    /// Log format (json or text).
    #[arg(long, env = "ROOSTD_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ROOSTD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Parse from environment variables only, ignoring the process argv.
    ///
    /// Used by the daemon re-exec path, where configuration travels in
    /// `ROOSTD_*` variables rather than flags.
    pub fn try_parse_env() -> anyhow::Result<Self> {
        Ok(Self::try_parse_from(["roostd"])?)
    }

    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ring_capacity == 0 {
            anyhow::bail!("--ring-capacity must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("--log-format must be json or text");
        }
        Ok(())
    }

    /// Effective state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    /// On-disk layout under the state directory.
    pub fn paths(&self) -> DaemonPaths {
        DaemonPaths::under(&self.state_dir())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            ring_capacity: ring::DEFAULT_CAPACITY,
            foreground: false,
            log_format: "json".to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

/// The daemon's only on-disk footprint: socket, pid-file, log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub state_dir: PathBuf,
    pub socket: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl DaemonPaths {
    pub fn under(dir: &Path) -> Self {
        Self {
            state_dir: dir.to_path_buf(),
            socket: dir.join("roostd.sock"),
            pid_file: dir.join("roostd.pid"),
            log_file: dir.join("roostd.log"),
        }
    }
}

/// Per-user state directory: `$XDG_STATE_HOME/roost`, falling back to
/// `~/.local/state/roost`.
pub fn default_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
        let dir = PathBuf::from(dir);
        if dir.is_absolute() {
            return dir.join("roost");
        }
    }
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"));
    home.join(".local").join("state").join("roost")
}

/// Initialize tracing from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / ROOSTD_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("ROOSTD_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
