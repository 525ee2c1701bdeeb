use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use runner_common::{Result, RunnerError};

/// Engine settings, read once from `AGENT_RUNNER_*` environment variables
/// at startup. Nothing here is hot-reloaded.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding one subdirectory per cached image.
    pub cache_dir: PathBuf,
    /// Cache capacity in bytes. Only entries with no live references are
    /// evicted to get back under this.
    pub cache_max_bytes: u64,
    /// Cache capacity in entries.
    pub cache_max_entries: usize,
    /// First host port handed to containers.
    pub port_range_start: u16,
    /// Number of ports in the pool.
    pub port_range_size: u16,
    /// Soft bound on concurrently running containers; the reaper evicts
    /// idle instances down to this.
    pub max_instances: usize,
    /// Instances idle longer than this are stopped by the reaper.
    pub idle_timeout: Duration,
    /// How often the reaper sweeps.
    pub reap_interval: Duration,
    /// How long a freshly started container gets to open its listener.
    pub readiness_timeout: Duration,
    /// Delay between readiness probes.
    pub readiness_poll_interval: Duration,
    /// Deadline applied to requests that do not carry their own.
    pub default_deadline: Duration,
    /// Upper clamp for caller-supplied deadlines.
    pub max_deadline: Duration,
    /// Container runtime name passed to Docker (e.g. "runsc" for gVisor).
    /// None uses the daemon default.
    pub container_runtime: Option<String>,
    /// Collector endpoint for best-effort receipt uploads.
    pub receipts_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/agent-runner/images"),
            cache_max_bytes: 10 * 1024 * 1024 * 1024,
            cache_max_entries: 64,
            port_range_start: 30000,
            port_range_size: 512,
            max_instances: 8,
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(60),
            readiness_poll_interval: Duration::from_millis(500),
            default_deadline: Duration::from_secs(120),
            max_deadline: Duration::from_secs(600),
            container_runtime: None,
            receipts_url: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            cache_dir: env::var("AGENT_RUNNER_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_max_bytes: parse_env("AGENT_RUNNER_CACHE_MAX_BYTES", defaults.cache_max_bytes)?,
            cache_max_entries: parse_env(
                "AGENT_RUNNER_CACHE_MAX_ENTRIES",
                defaults.cache_max_entries,
            )?,
            port_range_start: parse_env("AGENT_RUNNER_PORT_RANGE_START", defaults.port_range_start)?,
            port_range_size: parse_env("AGENT_RUNNER_PORT_RANGE_SIZE", defaults.port_range_size)?,
            max_instances: parse_env("AGENT_RUNNER_MAX_INSTANCES", defaults.max_instances)?,
            idle_timeout: parse_secs("AGENT_RUNNER_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            reap_interval: parse_secs("AGENT_RUNNER_REAP_INTERVAL_SECS", defaults.reap_interval)?,
            readiness_timeout: parse_secs(
                "AGENT_RUNNER_READINESS_TIMEOUT_SECS",
                defaults.readiness_timeout,
            )?,
            readiness_poll_interval: parse_millis(
                "AGENT_RUNNER_READINESS_POLL_MS",
                defaults.readiness_poll_interval,
            )?,
            default_deadline: parse_millis(
                "AGENT_RUNNER_DEFAULT_TIMEOUT_MS",
                defaults.default_deadline,
            )?,
            max_deadline: parse_millis("AGENT_RUNNER_MAX_TIMEOUT_MS", defaults.max_deadline)?,
            container_runtime: env::var("AGENT_RUNNER_RUNTIME").ok().filter(|s| !s.is_empty()),
            receipts_url: env::var("AGENT_RUNNER_RECEIPTS_URL")
                .ok()
                .filter(|s| !s.is_empty()),
        };
        if u32::from(config.port_range_start) + u32::from(config.port_range_size) > 65536 {
            return Err(RunnerError::Config(format!(
                "port range {}+{} runs past port 65535",
                config.port_range_start, config.port_range_size
            )));
        }
        Ok(config)
    }

    /// Clamps a caller-supplied deadline into the configured window,
    /// falling back to the default when the caller gave none.
    pub fn effective_deadline(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_deadline)
            .min(self.max_deadline)
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RunnerError::Config(format!("{key} has invalid value {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn parse_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(parse_env(
        key,
        default.as_secs(),
    )?))
}

fn parse_millis(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(parse_env(
        key,
        default.as_millis() as u64,
    )?))
}
