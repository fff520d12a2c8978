//! Server configuration.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Environment variables (CHATDESK_*)
//! 2. Config file ($CHATDESK_DIR/config.toml)
//! 3. Default values

use anyhow::Context;
use chatdesk_core::SessionConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:7420";
const DEFAULT_NOTIFICATION_CAPACITY: usize = 100;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to configuration file
    pub config_path: PathBuf,
    /// Address the REST API listens on
    pub bind_address: SocketAddr,
    /// Database path
    pub database_path: PathBuf,
    /// PID file path
    pub pid_file: PathBuf,
    /// Service token file path
    pub service_token_file: PathBuf,
    /// Session lifecycle settings
    pub session: SessionConfig,
    /// Events kept per organization by the notification feed
    pub notification_capacity: usize,
    /// Buffer of the HITL event bus
    pub event_channel_capacity: usize,
}

/// Shape of config.toml. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind_address: Option<String>,
    database_path: Option<PathBuf>,
    #[serde(default)]
    session: Option<SessionConfig>,
    #[serde(default)]
    notifications: NotificationsSection,
    #[serde(default)]
    events: EventsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NotificationsSection {
    capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EventsSection {
    channel_capacity: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::with_dir(&home.join(".chatdesk"))
    }
}

impl Config {
    /// Defaults rooted at `dir`
    fn with_dir(dir: &Path) -> Self {
        let server_dir = dir.join("server");
        Self {
            config_path: dir.join("config.toml"),
            bind_address: DEFAULT_BIND_ADDRESS
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 7420))),
            database_path: dir.join("chatdesk.db"),
            pid_file: server_dir.join("server.pid"),
            service_token_file: server_dir.join("service-token"),
            session: SessionConfig::default(),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Load configuration from file, environment, or defaults
    ///
    /// Standard directory structure:
    /// ```text
    /// ~/.chatdesk/
    /// ├── config.toml           # Main configuration
    /// ├── chatdesk.db           # Database
    /// └── server/
    ///     ├── service-token     # Service token for the front end
    ///     └── server.pid        # PID file
    /// ```
    pub fn load() -> anyhow::Result<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        // Use CHATDESK_DIR env var if set, otherwise ~/.chatdesk
        let dir = std::env::var("CHATDESK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".chatdesk"));

        std::fs::create_dir_all(dir.join("server"))
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut config = Self::with_dir(&dir);

        if config.config_path.exists() {
            let raw = std::fs::read_to_string(&config.config_path)
                .with_context(|| format!("reading {}", config.config_path.display()))?;
            let file: FileConfig = toml::from_str(&raw)
                .with_context(|| format!("parsing {}", config.config_path.display()))?;
            config.apply_file(file)?;
        }

        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> anyhow::Result<()> {
        if let Some(addr) = file.bind_address {
            self.bind_address = parse_addr(&addr)?;
        }
        if let Some(path) = file.database_path {
            self.database_path = path;
        }
        if let Some(session) = file.session {
            session.validate()?;
            self.session = session;
        }
        if let Some(capacity) = file.notifications.capacity {
            self.notification_capacity = capacity;
        }
        if let Some(capacity) = file.events.channel_capacity {
            self.event_channel_capacity = capacity;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(addr) = std::env::var("CHATDESK_BIND_ADDRESS") {
            self.bind_address = parse_addr(&addr)?;
        }
        if let Ok(path) = std::env::var("CHATDESK_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        self.session = self.session.clone().apply_env()?;
        Ok(())
    }
}

fn parse_addr(raw: &str) -> anyhow::Result<SocketAddr> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid bind address '{}'", raw))
}
