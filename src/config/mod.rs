use serde::Deserialize;
use std::path::{Path, PathBuf};
use sysinfo::System;
use tracing::error;

const DEFAULT_PORT: u16 = 4710;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HISTORY_CAPACITY: usize = 100;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Node identity this agent answers for (default: hostname).
    node_id: Option<String>,
    /// Dispatch server port (default: 4710).
    port: Option<u16>,
    /// Bind address for the dispatch server (default: "127.0.0.1").
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,stationd=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default, human-readable) | "json" (structured).
    log_format: Option<String>,
    /// Directory for per-task log files (default: {data_dir}/logs).
    log_dir: Option<PathBuf>,
    /// Default wall-clock budget for one task, in seconds (default: 300).
    task_timeout_secs: Option<u64>,
    /// How many finished tasks the in-memory history retains (default: 100).
    history_capacity: Option<usize>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── AgentConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node identity this agent answers dispatch traffic for.
    /// Requests declaring a different target node are rejected.
    pub node_id: String,
    pub port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    /// Log level filter for the daemon log (not the per-task logs).
    pub log: String,
    /// "pretty" | "json".
    pub log_format: String,
    /// Per-task log files live under `{log_dir}/tasks/`.
    pub log_dir: PathBuf,
    /// Default wall-clock budget for one task. Queues may override.
    pub task_timeout_secs: u64,
    /// Bounded history size; oldest entries are evicted first.
    pub history_capacity: usize,
}

impl AgentConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        node_id: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let node_id = node_id
            .or(toml.node_id)
            .or_else(System::host_name)
            .unwrap_or_else(|| "station-local".to_string());

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let bind_address = bind_address
            .or(std::env::var("STATIOND_BIND").ok().filter(|s| !s.is_empty()))
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let log_format = std::env::var("STATIOND_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let log_dir = std::env::var("STATIOND_LOG_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .or(toml.log_dir)
            .unwrap_or_else(|| data_dir.join("logs"));

        let task_timeout_secs = std::env::var("STATIOND_TASK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(toml.task_timeout_secs)
            .unwrap_or(DEFAULT_TASK_TIMEOUT_SECS);

        let history_capacity = toml.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY);

        Self {
            node_id,
            port,
            bind_address,
            data_dir,
            log,
            log_format,
            log_dir,
            task_timeout_secs,
            history_capacity,
        }
    }

    /// Machine inventory records, one JSON file per machine.
    pub fn machine_dir(&self) -> PathBuf {
        self.data_dir.join("machines")
    }

    /// Staged and active disk-encryption recovery configurations.
    pub fn recovery_dir(&self) -> PathBuf {
        self.data_dir.join("recovery")
    }

    /// Provisioning guard markers, one per resource id.
    pub fn guard_dir(&self) -> PathBuf {
        self.data_dir.join("guards")
    }

    /// Per-task log files, one per accepted request.
    pub fn task_log_dir(&self) -> PathBuf {
        self.log_dir.join("tasks")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/stationd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("stationd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/stationd or ~/.local/share/stationd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("stationd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("stationd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\stationd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("stationd");
        }
    }
    // Fallback
    PathBuf::from(".stationd")
}
