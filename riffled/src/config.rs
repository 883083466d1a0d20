use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/riffle/riffle.toml";
const ENV_CONFIG_PATH: &str = "RIFFLE_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `RIFFLE_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    pub fn load_from(path: &PathBuf) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Core used when a worker has to be conjured up implicitly.
    #[serde(default = "default_core")]
    pub default_core: usize,
    #[serde(default = "default_scheduler")]
    pub default_scheduler: String,
    /// Packet buffers per NUMA-node pool.
    #[serde(default = "default_buffers")]
    pub buffers_per_socket: usize,
    /// Skip the huge-page pool and use plain pages (tests, containers).
    #[serde(default)]
    pub plain_pools: bool,
    /// Install the default per-gate tracking hook on every new connection.
    #[serde(default = "default_track_gates")]
    pub track_gates: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_core: default_core(),
            default_scheduler: default_scheduler(),
            buffers_per_socket: default_buffers(),
            plain_pools: false,
            track_gates: default_track_gates(),
        }
    }
}

fn default_core() -> usize {
    0
}
fn default_scheduler() -> String {
    "default".to_string()
}
fn default_buffers() -> usize {
    16384
}
fn default_track_gates() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:10514".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Panic payload and backtrace land here before the process aborts.
    #[serde(default = "default_crash_file")]
    pub crash_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            crash_file: default_crash_file(),
        }
    }
}

fn default_crash_file() -> String {
    "/var/log/riffle/crash.log".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[runtime]
default_core = 2
buffers_per_socket = 4096
plain_pools = true
[api]
bind = "0.0.0.0:9000"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.runtime.default_core, 2);
        assert_eq!(cfg.runtime.buffers_per_socket, 4096);
        assert!(cfg.runtime.plain_pools);
        assert!(cfg.runtime.track_gates);
        assert_eq!(cfg.runtime.default_scheduler, "default");
        assert_eq!(cfg.api.bind, "0.0.0.0:9000");
        assert_eq!(cfg.logging.crash_file, "/var/log/riffle/crash.log");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load_from(&PathBuf::from("/nonexistent/riffle.toml"));
        assert_eq!(cfg.api.bind, "127.0.0.1:10514");
        assert_eq!(cfg.runtime.buffers_per_socket, 16384);
    }

    #[test]
    fn file_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\ndefault_scheduler = \"experimental\"").unwrap();
        let cfg = Config::load_from(&file.path().to_path_buf());
        assert_eq!(cfg.runtime.default_scheduler, "experimental");
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\nplain_pools = true").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let cfg = Config::load();
        assert!(cfg.runtime.plain_pools);
        std::env::remove_var(ENV_CONFIG_PATH);
    }
}
