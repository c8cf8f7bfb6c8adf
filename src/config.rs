use crate::health::RetryPolicy;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the git options to the backend
pub const GIT_ENV_VAR: &str = "LUMECMS_GIT";

/// Longest accepted idle or request timeout (30 days)
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The single lazily-started backend
    pub backend: BackendConfig,

    /// Git action endpoint
    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public proxy port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle connections kept to the backend (default: 10)
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_max_idle: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Backoff and failure policy for booting the backend
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Delay before the second probe, in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Linear increment added after every failed probe
    #[serde(default = "default_step")]
    pub step_ms: u64,

    /// Cap on a single delay (unset = uncapped)
    pub max_delay_ms: Option<u64>,

    /// Overall ceiling for one boot, 0 = wait until the process exits
    #[serde(default)]
    pub startup_timeout_secs: u64,

    /// Timeout for one readiness probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Consecutive boot failures before refusing to spawn, 0 = never refuse
    #[serde(default)]
    pub max_boot_failures: u32,

    /// How long spawning stays refused once the threshold is reached
    #[serde(default = "default_boot_failure_cooldown")]
    pub boot_failure_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            step_ms: default_step(),
            max_delay_ms: None,
            startup_timeout_secs: 0,
            probe_timeout_ms: default_probe_timeout(),
            max_boot_failures: 0,
            boot_failure_cooldown_secs: default_boot_failure_cooldown(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            step: Duration::from_millis(self.step_ms),
            max_delay: self.max_delay_ms.map(Duration::from_millis),
            deadline: (self.startup_timeout_secs > 0)
                .then(|| Duration::from_secs(self.startup_timeout_secs)),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn boot_failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.boot_failure_cooldown_secs)
    }
}

/// Configuration for the supervised backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// proxy. Configuration files must only be writable by trusted users.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Executable to launch
    pub command: String,

    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Host the backend listens on (default: localhost)
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port the backend listens on (default: 3000)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Path prefix of the admin application (default: /admin)
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Event socket path, relative to `base_path` (default: /_socket)
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Readiness probe path (default: /)
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Idle time before the backend is stopped (default: two hours)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Pipe the backend's stdout/stderr into the startup page
    #[serde(default)]
    pub show_output: bool,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Max time to wait for a forwarded response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::local("deno", default_backend_port())
    }
}

impl BackendConfig {
    /// Create a backend config with defaults
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            host: default_backend_host(),
            port,
            base_path: default_base_path(),
            socket_path: default_socket_path(),
            health_path: default_health_path(),
            idle_timeout_secs: default_idle_timeout(),
            show_output: false,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            request_timeout_secs: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `host:port` of the backend
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL of the backend's internal event channel
    pub fn socket_url(&self) -> String {
        format!(
            "ws://{}{}{}",
            self.authority(),
            self.base_path,
            self.socket_path
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("backend: 'command' must not be empty".to_string());
        }
        if self.port == 0 {
            errors.push("backend: 'port' must be greater than 0".to_string());
        }
        if self.host.is_empty() {
            errors.push("backend: 'host' must not be empty".to_string());
        }
        if !self.base_path.is_empty()
            && (!self.base_path.starts_with('/') || self.base_path.ends_with('/'))
        {
            errors.push(format!(
                "backend: 'base_path' must start with '/' and not end with '/' (got '{}')",
                self.base_path
            ));
        }
        if !self.socket_path.starts_with('/') {
            errors.push(format!(
                "backend: 'socket_path' must start with '/' (got '{}')",
                self.socket_path
            ));
        }
        if !self.health_path.starts_with('/') {
            errors.push(format!(
                "backend: 'health_path' must start with '/' (got '{}')",
                self.health_path
            ));
        }
        if self.idle_timeout_secs == 0 || self.idle_timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(format!(
                "backend: 'idle_timeout_secs' must be between 1 and {} (got {})",
                MAX_TIMEOUT_SECS, self.idle_timeout_secs
            ));
        }
        if self.request_timeout_secs == 0 || self.request_timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(format!(
                "backend: 'request_timeout_secs' must be between 1 and {} (got {})",
                MAX_TIMEOUT_SECS, self.request_timeout_secs
            ));
        }
        if self.retry.initial_delay_ms == 0 && self.retry.step_ms == 0 {
            errors.push(
                "backend.retry: 'initial_delay_ms' and 'step_ms' cannot both be 0".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Git action endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GitConfig {
    /// Accept `POST <base_path>/_git`
    #[serde(default)]
    pub enabled: bool,

    /// Git executable (default: git)
    #[serde(default = "default_git_command")]
    pub command: String,

    /// Repository directory (default: backend working directory)
    pub working_dir: Option<PathBuf>,

    /// Passed to the backend as JSON so it can show its git controls
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_git_command(),
            working_dir: None,
            options: BTreeMap::new(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_pool_max_idle() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_backend_host() -> String {
    "localhost".to_string()
}

fn default_backend_port() -> u16 {
    3000
}

fn default_base_path() -> String {
    "/admin".to_string()
}

fn default_socket_path() -> String {
    "/_socket".to_string()
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_idle_timeout() -> u64 {
    2 * 60 * 60 // two hours
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    60
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_step() -> u64 {
    1000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_boot_failure_cooldown() -> u64 {
    60
}

fn default_git_command() -> String {
    "git".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(mut e) = self.backend.validate() {
            errors.append(&mut e);
        }

        if self.git.enabled && self.git.command.trim().is_empty() {
            errors.push("git: 'command' must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// The backend settings to launch with.
    ///
    /// With git enabled, the backend also gets the git options as JSON in
    /// [`GIT_ENV_VAR`].
    pub fn launch_backend(&self) -> anyhow::Result<BackendConfig> {
        let mut backend = self.backend.clone();
        if self.git.enabled {
            let options = serde_json::to_string(&self.git.options)
                .map_err(|e| anyhow::anyhow!("Failed to encode git options: {}", e))?;
            backend.env.insert(GIT_ENV_VAR.to_string(), options);
        }
        Ok(backend)
    }

    /// Directory git commands run in
    pub fn git_dir(&self) -> Option<PathBuf> {
        self.git
            .working_dir
            .clone()
            .or_else(|| self.backend.working_dir.clone())
    }
}
