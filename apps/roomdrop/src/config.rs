//! CLI configuration, stored as TOML in `~/.config/roomdrop/config.toml`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use roomdrop_data_channel::DeliveryFlavor;
use roomdrop_session::SessionConfig;
use roomdrop_session::tcp::TcpPeerConfig;
use roomdrop_transfer::{Pacing, ReceiverConfig, SenderConfig};
use serde::{Deserialize, Serialize};

/// How received binary messages are surfaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    #[default]
    Buffer,
    Blob,
}

impl From<Delivery> for DeliveryFlavor {
    fn from(d: Delivery) -> Self {
        match d {
            Delivery::Buffer => DeliveryFlavor::Buffer,
            Delivery::Blob => DeliveryFlavor::Blob,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Rendezvous relay the client connects to.
    pub signaling_url: String,
    /// Listen address of `roomdrop relay`.
    pub relay_listen: SocketAddr,
    /// Where received files are written.
    pub download_dir: PathBuf,
    /// Address the direct listener binds to.
    pub bind_addr: IpAddr,
    /// Addresses announced to the peer. Empty means all local addresses.
    pub candidate_addrs: Vec<IpAddr>,
    pub delivery: Delivery,
    pub negotiation_timeout_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
    /// Delay between chunks. Unset yields to the scheduler instead.
    pub pacing_interval_ms: Option<u64>,
    pub checksum: bool,
    pub max_transfer_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8787".into(),
            relay_listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8787),
            download_dir: PathBuf::from("."),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            candidate_addrs: Vec::new(),
            delivery: Delivery::Buffer,
            negotiation_timeout_secs: Some(60),
            stall_timeout_secs: Some(30),
            pacing_interval_ms: None,
            checksum: true,
            max_transfer_bytes: ReceiverConfig::default().max_transfer_bytes,
        }
    }
}

impl AppConfig {
    /// Loads the config at `path` (or the default location).
    ///
    /// A missing file is created with defaults. An unreadable one is
    /// reported and replaced by defaults in memory only.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_path()?,
        };

        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save(&path) {
                tracing::warn!(path = %path.display(), "could not write default config: {e}");
            }
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to parse config, using defaults: {e}");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        let pacing = match self.pacing_interval_ms {
            Some(ms) if ms > 0 => Pacing::Interval(Duration::from_millis(ms)),
            _ => Pacing::Yield,
        };
        SessionConfig {
            negotiation_timeout: self.negotiation_timeout_secs.map(Duration::from_secs),
            sender: SenderConfig {
                pacing,
                checksum: self.checksum,
                ..SenderConfig::default()
            },
            receiver: ReceiverConfig {
                max_transfer_bytes: self.max_transfer_bytes,
                stall_timeout: self.stall_timeout_secs.map(Duration::from_secs),
                progress_interval: Some(Duration::from_millis(500)),
            },
        }
    }

    pub fn tcp_config(&self) -> TcpPeerConfig {
        TcpPeerConfig {
            bind_addr: self.bind_addr,
            candidate_addrs: self.candidate_addrs.clone(),
            flavor: self.delivery.into(),
            ..TcpPeerConfig::default()
        }
    }
}

fn default_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("roomdrop").join("config.toml"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").context("APPDATA is not set")?;
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(".config"))
    }
}
