//! Configuration types.
//!
//! Everything is read from `AGENT_*` environment variables; unset variables fall back to
//! the values in the `Default` impls.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Host identity injected into every task container.
    pub host: String,
    /// Node serial number reported in heartbeats.
    pub serial_number: String,
    /// Command used to discover the serial number when `serial_number` is empty.
    pub serial_number_cmd: Option<String>,
    /// Node model reported in heartbeats.
    pub model: String,
    /// Node display name reported in heartbeats.
    pub name: String,
    /// Log level handed to task containers.
    pub task_log_level: String,
    /// Address returned when the relay asks for the `media` target.
    pub media_address: Option<String>,
    /// Path of the local durable cache.
    pub cache_path: PathBuf,
    /// First port handed out by the management-port allocator.
    pub manage_port_base: u16,
    /// Capacity of the pool used for resource bundle fetches.
    pub pool_capacity: usize,
    /// When the generic `init` config is re-pushed to a running task.
    pub repush: RepushPolicy,
    pub center: CenterConfig,
    pub container: ContainerConfig,
    pub request: RequestConfig,
    pub intervals: Intervals,
}

/// Remote center (control-plane) settings.
#[derive(Debug, Clone)]
pub struct CenterConfig {
    /// Center host; heartbeats fail with a configuration error while unset.
    pub host: Option<String>,
    pub manage_port: u16,
    pub heart_path: String,
    pub resource_path: String,
}

/// Container runtime and task control-API settings.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Runtime binary (`docker`, `podman`, ...).
    pub binary: String,
    pub network: String,
    /// Container name prefix; the container of task `t1` is `<prefix>t1`.
    pub name_prefix: String,
    /// Host directory under which each task gets its `/logs` volume.
    pub log_root: PathBuf,
    /// Upper bound for a single runtime invocation.
    pub command_timeout: Duration,
    /// Overrides the container name as host for control-API calls.
    pub control_host: Option<String>,
    /// Path prefix of the task control API (e.g. `/mapi`).
    pub control_path_prefix: String,
}

/// Shared HTTP client behaviour.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Client-level timeout of a single attempt.
    pub timeout: Duration,
    /// Attempts per control-API call; negative means unbounded.
    pub retries: i32,
    pub retry_delay: Duration,
}

/// Polling intervals of the control loops.
#[derive(Debug, Clone)]
pub struct Intervals {
    pub heart: Duration,
    pub bind: Duration,
    pub converge: Duration,
    pub keepalive: Duration,
}

/// Whether a version bump with unchanged access configuration re-sends `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepushPolicy {
    /// Re-push only when `accessType` or `accessParam` changed.
    #[default]
    OnAccessChange,
    /// Re-push on every version change.
    EveryVersion,
}

impl FromStr for RepushPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-change" | "on_change" | "onchange" => Ok(Self::OnAccessChange),
            "always" | "every-version" => Ok(Self::EveryVersion),
            other => Err(format!("expected `on-change` or `always`, got `{other}`")),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            serial_number: String::new(),
            serial_number_cmd: None,
            model: String::new(),
            name: String::new(),
            task_log_level: "info".to_string(),
            media_address: None,
            cache_path: PathBuf::from("./data/edge-reconciler.db"),
            manage_port_base: 32000,
            pool_capacity: 10,
            repush: RepushPolicy::default(),
            center: CenterConfig::default(),
            container: ContainerConfig::default(),
            request: RequestConfig::default(),
            intervals: Intervals::default(),
        }
    }
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            host: None,
            manage_port: 8080,
            heart_path: "/api/box/heart".to_string(),
            resource_path: "/api/resource/bundle".to_string(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            network: "app".to_string(),
            name_prefix: "task_".to_string(),
            log_root: PathBuf::from("/var/log/edge-reconciler"),
            command_timeout: Duration::from_secs(60),
            control_host: None,
            control_path_prefix: String::new(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            retries: 3,
            retry_delay: Duration::from_secs(3),
        }
    }
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            heart: Duration::from_secs(30),
            bind: Duration::from_secs(3),
            converge: Duration::from_secs(5),
            keepalive: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let center = CenterConfig {
            host: env_opt("AGENT_CENTER_HOST"),
            manage_port: env_parse("AGENT_CENTER_PORT", defaults.center.manage_port)?,
            heart_path: env_or("AGENT_CENTER_HEART_PATH", &defaults.center.heart_path),
            resource_path: env_or("AGENT_CENTER_RESOURCE_PATH", &defaults.center.resource_path),
        };

        let container = ContainerConfig {
            binary: env_or("AGENT_CONTAINER_BINARY", &defaults.container.binary),
            network: env_or("AGENT_CONTAINER_NETWORK", &defaults.container.network),
            name_prefix: env_or("AGENT_CONTAINER_PREFIX", &defaults.container.name_prefix),
            log_root: env_opt("AGENT_TASK_LOG_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.container.log_root),
            command_timeout: secs(
                "AGENT_CONTAINER_TIMEOUT_SECS",
                defaults.container.command_timeout,
            )?,
            control_host: env_opt("AGENT_CONTROL_HOST"),
            control_path_prefix: env_or(
                "AGENT_CONTROL_PATH_PREFIX",
                &defaults.container.control_path_prefix,
            ),
        };

        let request = RequestConfig {
            timeout: secs("AGENT_REQUEST_TIMEOUT_SECS", defaults.request.timeout)?,
            retries: env_parse("AGENT_REQUEST_RETRIES", defaults.request.retries)?,
            retry_delay: Duration::from_millis(env_parse(
                "AGENT_REQUEST_RETRY_DELAY_MS",
                defaults.request.retry_delay.as_millis() as u64,
            )?),
        };

        let intervals = Intervals {
            heart: secs("AGENT_HEART_INTERVAL_SECS", defaults.intervals.heart)?,
            bind: secs("AGENT_BIND_INTERVAL_SECS", defaults.intervals.bind)?,
            converge: secs("AGENT_CONVERGE_INTERVAL_SECS", defaults.intervals.converge)?,
            keepalive: secs("AGENT_KEEPALIVE_INTERVAL_SECS", defaults.intervals.keepalive)?,
        };

        let pool_capacity = env_parse("AGENT_POOL_CAPACITY", defaults.pool_capacity)?;
        if pool_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_POOL_CAPACITY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            host: env_or("AGENT_HOST", &defaults.host),
            serial_number: env_or("AGENT_SN", &defaults.serial_number),
            serial_number_cmd: env_opt("AGENT_SN_CMD"),
            model: env_or("AGENT_MODEL", &defaults.model),
            name: env_or("AGENT_NAME", &defaults.name),
            task_log_level: env_or("AGENT_TASK_LOG_LEVEL", &defaults.task_log_level),
            media_address: env_opt("AGENT_MEDIA_ADDRESS"),
            cache_path: env_opt("AGENT_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
            manage_port_base: env_parse("AGENT_MANAGE_PORT_BASE", defaults.manage_port_base)?,
            pool_capacity,
            repush: env_parse("AGENT_CONFIG_REPUSH", defaults.repush)?,
            center,
            container,
            request,
            intervals,
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => parse_value(key, &raw),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

fn secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
