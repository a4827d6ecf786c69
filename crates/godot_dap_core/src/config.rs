use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6006;

/// Per-operation budgets. Every blocking call takes one of these explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub command: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            command: Duration::from_secs(30),
            read: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DapConfig {
    pub host: String,
    pub port: u16,
    pub timeouts: Timeouts,
    /// Directory for the JSONL wire audit log. `None` disables it.
    pub audit_dir: Option<PathBuf>,
}

impl Default for DapConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeouts: Timeouts::default(),
            audit_dir: None,
        }
    }
}

impl DapConfig {
    pub fn new(host: impl Into<String>, port: u16, timeouts: Timeouts) -> Self {
        Self {
            host: host.into(),
            port,
            timeouts,
            audit_dir: None,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Timeouts::default();

        let host = std::env::var("GODOT_DAP_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = std::env::var("GODOT_DAP_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let timeouts = Timeouts {
            connect: duration_from_env("GODOT_DAP_CONNECT_TIMEOUT_MS").unwrap_or(defaults.connect),
            command: duration_from_env("GODOT_DAP_COMMAND_TIMEOUT_MS").unwrap_or(defaults.command),
            read: duration_from_env("GODOT_DAP_READ_TIMEOUT_MS").unwrap_or(defaults.read),
        };

        let audit_dir = std::env::var("GODOT_DAP_AUDIT_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Self {
            host,
            port,
            timeouts,
            audit_dir,
        }
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
