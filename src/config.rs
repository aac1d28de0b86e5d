//! Configuration module for kindle-bridge.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the bridge
#[derive(Parser, Debug)]
#[command(name = "kindle-bridge")]
#[command(author = "kindle-bridge authors")]
#[command(version = "0.1.0")]
#[command(about = "Relays a backend text service to an e-ink reader page", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the reader page, the relay endpoint and the display file
    Serve {
        /// Address to bind to (e.g., 0.0.0.0:8080)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Backend host the relay connects to
        #[arg(long)]
        backend_host: Option<String>,

        /// Backend port the relay connects to
        #[arg(long)]
        backend_port: Option<u16>,
    },

    /// Run the line-oriented text backend; stdin lines replace the message
    Backend {
        /// Address to bind to (e.g., 127.0.0.1:12345)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Initial message handed to every client
        #[arg(short, long)]
        message: Option<String>,

        /// Read activity events from stdin and publish composed sentences
        #[arg(long)]
        events: bool,
    },

    /// Poll a text endpoint and repaint the terminal until interrupted
    Poll {
        /// Endpoint to fetch on every tick
        #[arg(short, long)]
        url: Option<String>,

        /// Delay between the end of one fetch and the start of the next
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Perform one relay exchange and print the body
    Fetch,

    /// Replace the display file with the given text
    Write {
        /// Text to show on the reader
        text: String,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Display names for client and server addresses
    #[serde(default)]
    pub hosts: HashMap<String, String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Address to bind to
    #[serde(default = "default_http_listen")]
    pub listen: String,
    /// Path the relay endpoint is mounted on
    #[serde(default = "default_relay_path")]
    pub relay_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            relay_path: default_relay_path(),
        }
    }
}

/// Relay (backend client) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Backend host
    #[serde(default = "default_relay_host")]
    pub host: String,
    /// Backend port
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds (0 = wait for the peer to close)
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Maximum number of response bytes kept
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_backend_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: 0,
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

/// Backend text service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Address to bind to
    #[serde(default = "default_backend_listen")]
    pub listen: String,
    /// Message handed out until stdin supplies a new one
    #[serde(default)]
    pub message: String,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Treat stdin lines as activity events rather than finished messages
    #[serde(default)]
    pub events: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            listen: default_backend_listen(),
            message: String::new(),
            max_connections: default_max_connections(),
            events: false,
        }
    }
}

/// Poller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Endpoint fetched on every tick
    #[serde(default = "default_poll_url")]
    pub url: String,
    /// Delay between ticks in milliseconds, measured from fetch completion
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Per-fetch timeout in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            url: default_poll_url(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Display file configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    /// Directory served next to the reader page
    #[serde(default = "default_display_dir")]
    pub dir: PathBuf,
    /// Name of the text file the page polls
    #[serde(default = "default_display_file")]
    pub file: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            dir: default_display_dir(),
            file: default_display_file(),
        }
    }
}

impl DisplayConfig {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_relay_path() -> String {
    "/textReceiver".to_string()
}

fn default_relay_host() -> String {
    "localhost".to_string()
}

fn default_backend_port() -> u16 {
    12345
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_max_response_bytes() -> usize {
    1024 * 1024 // 1 MB
}

fn default_backend_listen() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_poll_url() -> String {
    "http://127.0.0.1:8080/helloClient.txt".to_string()
}

fn default_interval_ms() -> u64 {
    500
}

fn default_fetch_timeout_ms() -> u64 {
    5000
}

fn default_display_dir() -> PathBuf {
    PathBuf::from("kindleScreen")
}

fn default_display_file() -> String {
    "helloClient.txt".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub http: HttpConfig,
    pub relay: RelayConfig,
    pub backend: BackendConfig,
    pub poller: PollerConfig,
    pub display: DisplayConfig,
    pub hosts: HashMap<String, String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over a parsed TOML config and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            mut http,
            mut relay,
            mut backend,
            mut poller,
            display,
            logging,
            hosts,
        } = toml_config;

        match &cli.command {
            Command::Serve {
                listen,
                backend_host,
                backend_port,
            } => {
                if let Some(listen) = listen {
                    http.listen = listen.clone();
                }
                if let Some(host) = backend_host {
                    relay.host = host.clone();
                }
                if let Some(port) = backend_port {
                    relay.port = *port;
                }
            }
            Command::Backend {
                listen,
                message,
                events,
            } => {
                if let Some(listen) = listen {
                    backend.listen = listen.clone();
                }
                if let Some(message) = message {
                    backend.message = message.clone();
                }
                if *events {
                    backend.events = true;
                }
            }
            Command::Poll { url, interval_ms } => {
                if let Some(url) = url {
                    poller.url = url.clone();
                }
                if let Some(interval_ms) = interval_ms {
                    poller.interval_ms = *interval_ms;
                }
            }
            Command::Fetch | Command::Write { .. } => {}
        }

        if !http.relay_path.starts_with('/') || http.relay_path == "/" {
            return Err(ConfigError::Invalid(format!(
                "http.relay_path must start with '/' and not be the page root, got '{}'",
                http.relay_path
            )));
        }
        if poller.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poller.interval_ms must be greater than zero".to_string(),
            ));
        }
        if poller.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "poller.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if relay.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if relay.max_response_bytes == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_response_bytes must be greater than zero".to_string(),
            ));
        }
        if !is_plain_file_name(&display.file) {
            return Err(ConfigError::Invalid(format!(
                "display.file must be a plain file name of letters, digits, '.', '-' or '_', got '{}'",
                display.file
            )));
        }

        Ok(Config {
            command: cli.command,
            http,
            relay,
            backend,
            poller,
            display,
            hosts,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        })
    }
}

/// A name the page can embed verbatim in a script string and `ServeDir` can
/// resolve inside the display directory.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
