//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ota_core::Role;
use serde::Deserialize;

/// Daemon configuration. File: `--config <path>`, ~/.config/wasm-ota/config.toml or
/// /etc/wasm-ota/config.toml. Env overrides: OTA_ROLE, OTA_ADDR, OTA_DATA_DIR, OTA_MTU,
/// OTA_SOURCE, OTA_VERSION, OTA_REPUBLISH_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Sender: listen address. Receiver: address to connect to.
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
    /// Holds the payload slot and the validity region.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Sender only: `.wasm` imported into the slot on start.
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Sender only: version announced for the imported binary.
    #[serde(default = "default_version")]
    pub version: u8,
    /// Sender: pause after a connection before the first frame. Receiver: reconnect interval.
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// A frame not acknowledged within this window counts as failed.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_invoke_interval_ms")]
    pub invoke_interval_ms: u64,
    /// Sender only: offer the published binary again this often while the link is idle.
    /// 0 leaves it to new connections.
    #[serde(default = "default_republish_interval_ms")]
    pub republish_interval_ms: u64,
    #[serde(default = "default_invoke_args")]
    pub invoke_args: [u8; 2],
    /// Percentage of frames the sender drops before they reach the wire (testing lossy links).
    #[serde(default)]
    pub simulated_loss_percent: u8,
    #[serde(default)]
    pub core: ota_core::Config,
}

fn default_role() -> Role {
    Role::Receiver
}
fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 47800))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("wasm-ota-data")
}
fn default_version() -> u8 {
    1
}
fn default_connect_delay_ms() -> u64 {
    1000
}
fn default_frame_interval_ms() -> u64 {
    50
}
fn default_ack_timeout_ms() -> u64 {
    2000
}
fn default_invoke_interval_ms() -> u64 {
    1000
}
fn default_republish_interval_ms() -> u64 {
    30_000
}
fn default_invoke_args() -> [u8; 2] {
    [1, 2]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            addr: default_addr(),
            data_dir: default_data_dir(),
            source: None,
            version: default_version(),
            connect_delay_ms: default_connect_delay_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            invoke_interval_ms: default_invoke_interval_ms(),
            republish_interval_ms: default_republish_interval_ms(),
            invoke_args: default_invoke_args(),
            simulated_loss_percent: 0,
            core: ota_core::Config::default(),
        }
    }
}

impl Config {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn invoke_interval(&self) -> Duration {
        Duration::from_millis(self.invoke_interval_ms)
    }

    pub fn republish_interval(&self) -> Option<Duration> {
        (self.republish_interval_ms > 0).then(|| Duration::from_millis(self.republish_interval_ms))
    }

    pub fn invoke_args(&self) -> (u8, u8) {
        (self.invoke_args[0], self.invoke_args[1])
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.core.validate()?;
        if self.simulated_loss_percent > 100 {
            anyhow::bail!(
                "simulated_loss_percent {} is above 100",
                self.simulated_loss_percent
            );
        }
        if self.invoke_interval_ms == 0 {
            anyhow::bail!("invoke_interval_ms must be non-zero");
        }
        Ok(())
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => parse_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok())?;
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/wasm-ota/config.toml"));
    }
    out.push(PathBuf::from("/etc/wasm-ota/config.toml"));
    out
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("OTA_ROLE") {
        c.role = match s.to_ascii_lowercase().as_str() {
            "sender" => Role::Sender,
            "receiver" => Role::Receiver,
            other => anyhow::bail!("OTA_ROLE: unknown role {:?}", other),
        };
    }
    if let Some(s) = var("OTA_ADDR") {
        c.addr = s.parse().with_context(|| format!("OTA_ADDR: {:?}", s))?;
    }
    if let Some(s) = var("OTA_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Some(s) = var("OTA_MTU") {
        c.core.transfer.mtu = s.parse().with_context(|| format!("OTA_MTU: {:?}", s))?;
    }
    if let Some(s) = var("OTA_SOURCE") {
        c.source = Some(PathBuf::from(s));
    }
    if let Some(s) = var("OTA_VERSION") {
        c.version = s.parse().with_context(|| format!("OTA_VERSION: {:?}", s))?;
    }
    if let Some(s) = var("OTA_REPUBLISH_INTERVAL_MS") {
        c.republish_interval_ms = s
            .parse()
            .with_context(|| format!("OTA_REPUBLISH_INTERVAL_MS: {:?}", s))?;
    }
    Ok(())
}
