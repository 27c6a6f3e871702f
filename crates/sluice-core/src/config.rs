//! Task configuration.
//!
//! A [`TaskConfig`] is everything needed to build one running proxy
//! instance. It is stored as JSON and overridden piecemeal by CLI flags.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::rules::{DefaultStrategy, HostRule, HostRuleSet};

/// Default loopback listener port.
pub const DEFAULT_PORT: u16 = 8888;

/// Default LAN listener port.
pub const DEFAULT_LAN_PORT: u16 = 8889;

/// Default deadline for both handshake stages, in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Name of the loopback listener.
pub const LOOPBACK: &str = "loopback";

/// Name of the LAN listener.
pub const LAN: &str = "lan";

/// Returns the application's project directories.
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "sluice", "Sluice")
}

/// Returns the default data directory, falling back to `./sluice-data`.
pub fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("sluice-data"))
}

/// One listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    pub bind_address: IpAddr,
    pub port: u16,
    pub enabled: bool,
}

impl ListenerConfig {
    /// Creates an enabled listener.
    pub fn new(name: impl Into<String>, bind_address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            bind_address,
            port,
            enabled: true,
        }
    }

    /// Loopback listener on `127.0.0.1`.
    pub fn loopback(port: u16) -> Self {
        Self::new(LOOPBACK, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// LAN listener on all interfaces, disabled until asked for.
    pub fn lan(port: u16) -> Self {
        Self::new(LAN, IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).with_enabled(false)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Configuration of one proxy task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub listeners: Vec<ListenerConfig>,
    /// Man-in-the-middle CONNECT tunnels instead of relaying them blind.
    pub intercept_tls: bool,
    /// Offer `h2` in ALPN to intercepted clients.
    pub http2: bool,
    pub default_strategy: DefaultStrategy,
    pub rules: HostRuleSet,
    /// Directory for captured bodies. `None` means `<data_dir>/capture`.
    pub capture_dir: Option<PathBuf>,
    /// Directory holding the root and leaf keys. `None` means `<data_dir>/ca`.
    pub ca_dir: Option<PathBuf>,
    /// Deadline from CONNECT acknowledgement to the first client byte.
    pub client_hello_timeout_secs: u64,
    /// Deadline from ClientHello to handshake completion.
    pub handshake_timeout_secs: u64,
    /// Mint certificates for the SNI rather than the CONNECT authority.
    pub prefer_sni: bool,
    /// Worker threads; `None` uses the runtime default.
    pub workers: Option<usize>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            listeners: vec![
                ListenerConfig::loopback(DEFAULT_PORT),
                ListenerConfig::lan(DEFAULT_LAN_PORT),
            ],
            intercept_tls: true,
            http2: true,
            default_strategy: DefaultStrategy::Direct,
            rules: HostRuleSet::new(),
            capture_dir: None,
            ca_dir: None,
            client_hello_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            prefer_sni: false,
            workers: None,
        }
    }
}

impl TaskConfig {
    /// Loads a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Rejects configurations that cannot start.
    pub fn validate(&self) -> Result<()> {
        let mut seen = Vec::new();
        for listener in &self.listeners {
            if seen.contains(&listener.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate listener name {:?}",
                    listener.name
                )));
            }
            seen.push(listener.name.as_str());
        }
        if self.client_hello_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(CoreError::Config("handshake timeouts must be non-zero".into()));
        }
        if self.workers == Some(0) {
            return Err(CoreError::Config("worker count must be non-zero".into()));
        }
        Ok(())
    }

    /// Sets the port of the loopback listener, adding it if missing.
    pub fn with_port(mut self, port: u16) -> Self {
        self.listener_mut(LOOPBACK, || ListenerConfig::loopback(port)).port = port;
        self
    }

    /// Sets the LAN listener port and enables it.
    pub fn with_lan_port(mut self, port: u16) -> Self {
        let lan = self.listener_mut(LAN, || ListenerConfig::lan(port));
        lan.port = port;
        lan.enabled = true;
        self
    }

    /// Enables or disables the LAN listener.
    pub fn with_lan(mut self, enabled: bool) -> Self {
        self.listener_mut(LAN, || ListenerConfig::lan(DEFAULT_LAN_PORT)).enabled = enabled;
        self
    }

    pub fn with_intercept_tls(mut self, intercept: bool) -> Self {
        self.intercept_tls = intercept;
        self
    }

    pub fn with_http2(mut self, http2: bool) -> Self {
        self.http2 = http2;
        self
    }

    pub fn with_strategy(mut self, strategy: DefaultStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_rule(mut self, rule: HostRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_capture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capture_dir = Some(dir.into());
        self
    }

    pub fn with_ca_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(dir.into());
        self
    }

    pub fn with_prefer_sni(mut self, prefer: bool) -> Self {
        self.prefer_sni = prefer;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Replaces all listeners.
    pub fn with_listeners(mut self, listeners: Vec<ListenerConfig>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn client_hello_timeout(&self) -> Duration {
        Duration::from_secs(self.client_hello_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Capture directory, resolved against `data_dir`.
    pub fn capture_dir_in(&self, data_dir: &Path) -> PathBuf {
        self.capture_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("capture"))
    }

    /// CA directory, resolved against `data_dir`.
    pub fn ca_dir_in(&self, data_dir: &Path) -> PathBuf {
        self.ca_dir.clone().unwrap_or_else(|| data_dir.join("ca"))
    }

    /// Listeners with `enabled == true`.
    pub fn enabled_listeners(&self) -> impl Iterator<Item = &ListenerConfig> {
        self.listeners.iter().filter(|l| l.enabled)
    }

    fn listener_mut(
        &mut self,
        name: &str,
        make: impl FnOnce() -> ListenerConfig,
    ) -> &mut ListenerConfig {
        let idx = match self.listeners.iter().position(|l| l.name == name) {
            Some(idx) => idx,
            None => {
                self.listeners.push(make());
                self.listeners.len() - 1
            }
        };
        &mut self.listeners[idx]
    }
}
