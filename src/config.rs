use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for backends
    #[serde(default)]
    pub defaults: BackendDefaults,

    /// Supervised backends, in rotation order
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for both listeners (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the control API and dashboard (default: 8320)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Port for the round-robin load balancer (default: 8319)
    #[serde(default = "default_balancer_port")]
    pub balancer_port: u16,

    /// Host the load balancer forwards to (default: 127.0.0.1)
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Max time to wait for an upstream response before answering 502
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Delay between stop and start when a backend is restarted
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Directory of static dashboard files served by the control API
    pub static_dir: Option<String>,

    /// Bearer token required on /api/* when set
    pub control_token: Option<String>,

    /// Let the "stop" control action actually stop the backend (default: false)
    #[serde(default)]
    pub enable_stop_action: bool,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            control_port: default_control_port(),
            balancer_port: default_balancer_port(),
            upstream_host: default_upstream_host(),
            request_timeout_secs: default_request_timeout(),
            restart_delay_ms: default_restart_delay(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            static_dir: None,
            control_token: None,
            enable_stop_action: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendDefaults {
    /// Executable started for every backend
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments for a normal start
    #[serde(default)]
    pub args: Vec<String>,

    /// Arguments for an interactive login session
    #[serde(default = "default_login_args")]
    pub login_args: Vec<String>,

    /// Directory the executable writes credential files to (`~` is expanded)
    #[serde(default = "default_credential_dir")]
    pub credential_dir: String,

    /// Terminal launcher prefix for login sessions, e.g. "x-terminal-emulator -e"
    pub login_terminal: Option<String>,

    /// Start backends when the supervisor boots
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            login_args: default_login_args(),
            credential_dir: default_credential_dir(),
            login_terminal: None,
            autostart: default_autostart(),
        }
    }
}

/// Configuration for a single backend
///
/// # Security Warning
///
/// `command` and `args` allow arbitrary command execution. Configuration files
/// must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Logical identifier, unique across the configuration
    pub id: String,

    /// Working directory the executable runs in
    pub working_dir: String,

    /// Port the backend listens on
    pub port: u16,

    /// Executable (overrides default)
    pub command: Option<String>,

    /// Arguments for a normal start (overrides default)
    pub args: Option<Vec<String>>,

    /// Arguments for an interactive login (overrides default)
    pub login_args: Option<Vec<String>>,

    /// Credential directory (overrides default)
    pub credential_dir: Option<String>,

    /// Start on boot (overrides default)
    pub autostart: Option<bool>,
}

impl BackendConfig {
    /// Create a backend config that inherits everything else from defaults
    pub fn new(id: &str, working_dir: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            working_dir: working_dir.to_string(),
            port,
            command: None,
            args: None,
            login_args: None,
            credential_dir: None,
            autostart: None,
        }
    }

    /// Set the executable and its arguments (builder pattern)
    pub fn with_command(mut self, command: &str, args: Vec<String>) -> Self {
        self.command = Some(command.to_string());
        self.args = Some(args);
        self
    }

    /// Set the credential directory (builder pattern)
    pub fn with_credential_dir(mut self, dir: &str) -> Self {
        self.credential_dir = Some(dir.to_string());
        self
    }

    pub fn command<'a>(&'a self, defaults: &'a BackendDefaults) -> &'a str {
        self.command.as_deref().unwrap_or(&defaults.command)
    }

    pub fn args<'a>(&'a self, defaults: &'a BackendDefaults) -> &'a [String] {
        self.args.as_deref().unwrap_or(&defaults.args)
    }

    pub fn login_args<'a>(&'a self, defaults: &'a BackendDefaults) -> &'a [String] {
        self.login_args.as_deref().unwrap_or(&defaults.login_args)
    }

    pub fn credential_dir<'a>(&'a self, defaults: &'a BackendDefaults) -> &'a str {
        self.credential_dir
            .as_deref()
            .unwrap_or(&defaults.credential_dir)
    }

    pub fn autostart(&self, defaults: &BackendDefaults) -> bool {
        self.autostart.unwrap_or(defaults.autostart)
    }

    /// Validate the backend configuration
    pub fn validate(&self, defaults: &BackendDefaults) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Backend with empty 'id'".to_string());
        }

        if self.port == 0 {
            return Err(format!(
                "Backend '{}': 'port' must be greater than 0",
                self.id
            ));
        }

        if self.command(defaults).trim().is_empty() {
            return Err(format!("Backend '{}': 'command' must not be empty", self.id));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    8320
}

fn default_balancer_port() -> u16 {
    8319
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    120 // completions can stream for a while
}

fn default_restart_delay() -> u64 {
    2000 // lets the old process release its port
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_command() -> String {
    "cli-proxy-api-plus".to_string()
}

fn default_login_args() -> Vec<String> {
    vec!["--antigravity-login".to_string()]
}

fn default_credential_dir() -> String {
    "~/.cli-proxy-api".to_string()
}

fn default_autostart() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.backends.is_empty() {
            errors.push("At least one [[backends]] entry is required".to_string());
        }

        let mut seen = HashSet::new();
        let mut ports = HashSet::new();
        for backend in &self.backends {
            if let Err(e) = backend.validate(&self.defaults) {
                errors.push(e);
            }
            if !seen.insert(backend.id.as_str()) {
                errors.push(format!("Backend '{}': duplicate id", backend.id));
            }
            if backend.port != 0 && !ports.insert(backend.port) {
                errors.push(format!(
                    "Backend '{}': port {} is used by another backend",
                    backend.id, backend.port
                ));
            }
            if backend.port == self.server.control_port || backend.port == self.server.balancer_port {
                errors.push(format!(
                    "Backend '{}': port {} collides with a server port",
                    backend.id, backend.port
                ));
            }
        }

        if self.server.control_port == 0 || self.server.balancer_port == 0 {
            errors.push("Server ports must be greater than 0".to_string());
        } else if self.server.control_port == self.server.balancer_port {
            errors.push(format!(
                "control_port and balancer_port must differ (both {})",
                self.server.control_port
            ));
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("request_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "0.0.0.0"
control_port = 9320
balancer_port = 9319
request_timeout_secs = 30

[defaults]
command = "cli-proxy-api-plus.exe"
credential_dir = "/var/lib/proxy/auth"

[[backends]]
id = "primary"
working_dir = "../CLIProxyAPIPlus"
port = 8317

[[backends]]
id = "secondary"
working_dir = "../CLIProxyAPIPlus_Secondary"
port = 8318
credential_dir = "/var/lib/proxy/auth2"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.control_port, 9320);
        assert_eq!(config.server.balancer_port, 9319);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(30));

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].id, "primary");
        assert_eq!(config.backends[1].id, "secondary");

        let primary = &config.backends[0];
        assert_eq!(primary.command(&config.defaults), "cli-proxy-api-plus.exe");
        assert_eq!(primary.credential_dir(&config.defaults), "/var/lib/proxy/auth");

        let secondary = &config.backends[1];
        assert_eq!(secondary.credential_dir(&config.defaults), "/var/lib/proxy/auth2");
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.control_port, 8320);
        assert_eq!(config.balancer_port, 8319);
        assert_eq!(config.restart_delay(), Duration::from_secs(2));
        assert!(!config.enable_stop_action);
        assert!(config.static_dir.is_none());
    }

    #[test]
    fn test_default_backend_defaults() {
        let defaults = BackendDefaults::default();
        assert_eq!(defaults.command, "cli-proxy-api-plus");
        assert!(defaults.args.is_empty());
        assert_eq!(defaults.login_args, vec!["--antigravity-login".to_string()]);
        assert_eq!(defaults.credential_dir, "~/.cli-proxy-api");
        assert!(defaults.autostart);
    }

    #[test]
    fn test_backend_config_overrides_defaults() {
        let defaults = BackendDefaults::default();
        let mut backend = BackendConfig::new("primary", ".", 8317)
            .with_command("sleep", vec!["60".to_string()])
            .with_credential_dir("/tmp/creds");
        backend.login_args = Some(vec!["--login".to_string()]);
        backend.autostart = Some(false);

        assert_eq!(backend.command(&defaults), "sleep");
        assert_eq!(backend.args(&defaults), ["60".to_string()]);
        assert_eq!(backend.login_args(&defaults), ["--login".to_string()]);
        assert_eq!(backend.credential_dir(&defaults), "/tmp/creds");
        assert!(!backend.autostart(&defaults));
    }

    #[test]
    fn test_empty_backend_list_rejected() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("At least one"));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let toml = r#"
[[backends]]
id = "primary"
working_dir = "."
port = 8317

[[backends]]
id = "primary"
working_dir = "."
port = 8318
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate id"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
control_port = 8000
balancer_port = 8000

[[backends]]
id = "a"
working_dir = "."
port = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'port' must be greater than 0"));
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[[backends]]\nid = \"primary\"\nworking_dir = \".\"\nport = 8317\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backends[0].port, 8317);

        std::fs::write(&path, "[[backends]]\nid = \"\"\nworking_dir = \".\"\nport = 1\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
