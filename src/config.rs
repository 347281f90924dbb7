use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the watched network
pub const ENV_NETWORK: &str = "DOCKGATE_NETWORK";
/// Environment variable overriding the HTTP listener port
pub const ENV_HTTP_PORT: &str = "DOCKGATE_HTTP_PORT";
/// Environment variable overriding the HTTPS listener port
pub const ENV_HTTPS_PORT: &str = "DOCKGATE_HTTPS_PORT";
/// Environment variable overriding the ACME registration email
pub const ENV_ACME_EMAIL: &str = "DOCKGATE_ACME_EMAIL";
/// Environment variable overriding the log level
pub const ENV_LOG: &str = "DOCKGATE_LOG";

/// Top-level configuration, constructed once at startup and handed to each component
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Container discovery and reconciliation settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Serving engine (nginx/OpenResty) settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Certificate resolution settings
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Docker network whose containers are routed
    #[serde(default = "default_network")]
    pub network: String,

    /// HTTP port the serving engine listens on
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port the serving engine listens on (0 disables the TLS listener)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Port for the local admin API queried by the serving engine
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Docker endpoint (`unix:///path` or `tcp://host:port`); falls back to DOCKER_HOST
    pub docker_host: Option<String>,

    /// Log verbosity directive for the dockgate target
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            admin_port: default_admin_port(),
            docker_host: None,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Label whose value is the routable hostname
    #[serde(default = "default_host_label")]
    pub host_label: String,

    /// Label whose value is `{{upstreams <port>}}` or a bare port
    #[serde(default = "default_upstream_label")]
    pub upstream_label: String,

    /// Timeout for a single container listing call
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,

    /// Interval of the safety-net full sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Window in which triggers collapse into one reconciliation pass
    #[serde(default = "default_coalesce_window")]
    pub coalesce_window_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host_label: default_host_label(),
            upstream_label: default_upstream_label(),
            timeout_secs: default_discovery_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            coalesce_window_ms: default_coalesce_window(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Active configuration file read by the serving engine
    #[serde(default = "default_engine_config_path")]
    pub config_path: PathBuf,

    /// Validator command; `{config}` is replaced by the candidate file path
    #[serde(default = "default_validate_command")]
    pub validate_command: String,

    /// Reload command; `{config}` is replaced by the active file path
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Upper bound for each engine command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Directive added to TLS server blocks so the engine can ask the admin
    /// API for a per-host certificate during the handshake
    pub certificate_hook: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_path: default_engine_config_path(),
            validate_command: default_validate_command(),
            reload_command: default_reload_command(),
            command_timeout_secs: default_command_timeout(),
            certificate_hook: None,
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Request certificates from the ACME directory for routed hostnames
    #[serde(default = "default_true")]
    pub acme_enabled: bool,

    /// Contact email for the certificate authority (required when ACME is enabled)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Writable, persisted directory for issued certificates keyed by hostname
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Read-only mounted directory holding a shared `cert.pem`/`key.pem` pair
    pub shared_dir: Option<PathBuf>,

    /// Renew certificates this many days before they expire
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    /// First cooldown after a failed acquisition; doubles per consecutive failure
    #[serde(default = "default_cooldown_base")]
    pub cooldown_base_secs: u64,

    /// Cooldown ceiling
    #[serde(default = "default_cooldown_max")]
    pub cooldown_max_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            acme_enabled: true,
            email: None,
            directory_url: None,
            store_dir: default_store_dir(),
            shared_dir: None,
            renew_before_days: default_renew_before_days(),
            cooldown_base_secs: default_cooldown_base(),
            cooldown_max_secs: default_cooldown_max(),
        }
    }
}

impl TlsConfig {
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_days * 24 * 60 * 60)
    }

    /// Cooldown after `failures` consecutive failed acquisitions
    pub fn cooldown(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let secs = self
            .cooldown_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.cooldown_max_secs);
        Duration::from_secs(secs)
    }
}

fn default_network() -> String {
    "dockgate".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_admin_port() -> u16 {
    9180
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host_label() -> String {
    "dockgate.host".to_string()
}

fn default_upstream_label() -> String {
    "dockgate.upstream".to_string()
}

fn default_discovery_timeout() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_coalesce_window() -> u64 {
    2000
}

fn default_engine_config_path() -> PathBuf {
    PathBuf::from("/etc/nginx/nginx.conf")
}

fn default_validate_command() -> String {
    "nginx -t -q -c {config}".to_string()
}

fn default_reload_command() -> String {
    "nginx -s reload -c {config}".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./certs")
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_cooldown_base() -> u64 {
    60
}

fn default_cooldown_max() -> u64 {
    60 * 60
}

impl Config {
    /// Load from a TOML file, apply environment overrides, and validate
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Build from defaults plus environment overrides, for running without a config file
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DOCKGATE_*` overrides from an iterator of key/value pairs
    pub fn apply_overrides<I>(&mut self, vars: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_NETWORK => self.server.network = value,
                ENV_HTTP_PORT => {
                    self.server.http_port = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("{} must be a port number, got '{}'", key, value))?;
                }
                ENV_HTTPS_PORT => {
                    self.server.https_port = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("{} must be a port number, got '{}'", key, value))?;
                }
                ENV_ACME_EMAIL => {
                    self.tls.email = if value.is_empty() { None } else { Some(value) };
                }
                ENV_LOG => self.server.log_level = value,
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.network.trim().is_empty() {
            errors.push("server.network must not be empty".to_string());
        }
        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.server.https_port != 0 && self.server.https_port == self.server.http_port {
            errors.push("server.https_port must differ from server.http_port".to_string());
        }
        if self.server.admin_port == 0 {
            errors.push("server.admin_port must be non-zero".to_string());
        }
        if self.discovery.host_label.trim().is_empty() {
            errors.push("discovery.host_label must not be empty".to_string());
        }
        if self.discovery.upstream_label.trim().is_empty() {
            errors.push("discovery.upstream_label must not be empty".to_string());
        }
        if self.discovery.timeout_secs == 0 {
            errors.push("discovery.timeout_secs must be non-zero".to_string());
        }
        if self.discovery.sweep_interval_secs == 0 {
            errors.push("discovery.sweep_interval_secs must be non-zero".to_string());
        }
        if self.engine.config_path.as_os_str().is_empty() {
            errors.push("engine.config_path must not be empty".to_string());
        }
        for (name, command) in [
            ("engine.validate_command", &self.engine.validate_command),
            ("engine.reload_command", &self.engine.reload_command),
        ] {
            match shell_words::split(command) {
                Ok(words) if !words.is_empty() => {}
                Ok(_) => errors.push(format!("{} must not be empty", name)),
                Err(e) => errors.push(format!("{} is not a valid command: {}", name, e)),
            }
        }
        if self.tls.acme_enabled && self.tls.email.as_deref().map_or(true, str::is_empty) {
            errors.push("tls.email is required when tls.acme_enabled is set".to_string());
        }
        if self.tls.cooldown_base_secs == 0 || self.tls.cooldown_base_secs > self.tls.cooldown_max_secs {
            errors.push("tls.cooldown_base_secs must be non-zero and not exceed tls.cooldown_max_secs".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
