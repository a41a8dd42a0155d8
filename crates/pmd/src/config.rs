//! Daemon configuration.
//!
//! Everything the daemon touches lives under one home directory:
//!
//! ```text
//! $PM_HOME/            (default ~/.pm)
//! ├── config.toml      optional overrides
//! ├── pm.sock          control socket
//! ├── pm.pid           locked pid file
//! ├── pm.log           daemon log
//! ├── pm.db            process registry
//! └── logs/<id>.stdout|.stderr
//! ```
//!
//! `PM_SOCKET` overrides the socket path after the config file is applied.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// Environment variable selecting the home directory.
pub const HOME_ENV: &str = "PM_HOME";

/// Environment variable overriding the control socket path.
pub const SOCKET_ENV: &str = "PM_SOCKET";

/// Name of the optional config file inside the home directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Default housekeeping interval.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Default time `pmd kill` waits before escalating to SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// Resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub home: PathBuf,
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub db_file: PathBuf,
    pub logs_dir: PathBuf,
    pub monitor_interval: Duration,
    pub kill_grace: Duration,
}

/// On-disk overrides. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    socket: Option<PathBuf>,
    log_file: Option<PathBuf>,
    monitor_interval_secs: Option<u64>,
    kill_grace_secs: Option<u64>,
}

impl Config {
    /// Builds the default layout rooted at `home`, without reading anything.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            socket_path: home.join("pm.sock"),
            pid_file: home.join("pm.pid"),
            log_file: home.join("pm.log"),
            db_file: home.join("pm.db"),
            logs_dir: home.join("logs"),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
            home,
        }
    }

    /// Resolves the configuration from the environment and `config.toml`.
    ///
    /// # Errors
    ///
    /// Fails when no home directory can be determined or the config file
    /// exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let mut home = match env::var_os(HOME_ENV) {
            Some(home) if !home.is_empty() => PathBuf::from(home),
            _ => dirs::home_dir()
                .map(|h| h.join(".pm"))
                .ok_or(ConfigError::NoHomeDir)?,
        };
        // the detached daemon runs with a different working directory
        if home.is_relative() {
            if let Ok(cwd) = env::current_dir() {
                home = cwd.join(home);
            }
        }

        let mut config = Self::with_home(home);
        config.apply_file()?;

        if let Some(socket) = env::var_os(SOCKET_ENV).filter(|s| !s.is_empty()) {
            config.socket_path = PathBuf::from(socket);
        }

        Ok(config)
    }

    /// Applies `$home/config.toml` if present. Relative paths resolve against home.
    fn apply_file(&mut self) -> Result<(), ConfigError> {
        let path = self.home.join(CONFIG_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let file: ConfigFile =
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        debug!(path = %path.display(), "Loaded config file");

        if let Some(socket) = file.socket {
            self.socket_path = self.home.join(socket);
        }
        if let Some(log_file) = file.log_file {
            self.log_file = self.home.join(log_file);
        }
        if let Some(secs) = file.monitor_interval_secs.filter(|s| *s > 0) {
            self.monitor_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.kill_grace_secs {
            self.kill_grace = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Creates the home and per-process log directories.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.home)?;
        fs::create_dir_all(&self.logs_dir)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

/// Errors raised while resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot determine home directory; set {HOME_ENV}")]
    NoHomeDir,

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
