//! This file contains functions needed to deserialize the configuration
//! file. The configuration file contains the source-chain endpoint, the
//! shared redeem script this custodian participates in, and the knobs of the
//! scanning and retry loops.

use bitcoin::Network;
use serde::Deserialize;

use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// Which workers this process runs: both ends co-located, or one side of a
/// split deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    All,
    Observer,
    Signer,
}

/// Static information required by the daemon to operate
#[derive(Debug, Deserialize)]
pub struct Config {
    /// JSON-RPC endpoint of the source chain
    pub chain_rpc_url: String,
    /// Bitcoin network the bridge redeems on
    pub network: Network,
    /// Which workers to run
    pub mode: Mode,
    /// Hex of the multisig redeem script shared by all custodians
    pub redeem_script: String,
    /// An optional custom data directory
    pub data_dir: Option<PathBuf>,
    /// What messages to log
    pub log_level: Option<String>,
    /// Seconds between polls of the source-chain height
    pub poll_interval_secs: Option<u64>,
    /// Seconds slept before retrying a failed call
    pub backoff_secs: Option<u64>,
    /// How many quiet blocks may pass before the resume cursor is persisted
    pub checkpoint_interval: Option<u32>,
    /// Height to start scanning from, overriding the stored cursor
    pub start_height: Option<u32>,
    /// Capacity of the in-process signing queue
    pub queue_capacity: Option<usize>,
    /// host:port of the standalone signer, for observer mode
    pub signer_addr: Option<String>,
    /// Address to accept signing requests on, for signer mode
    pub listen: Option<SocketAddr>,
}

#[derive(PartialEq, Eq, Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Get the absolute path to the vendord configuration folder.
///
/// It's a "Vendord" directory in the XDG standard configuration directory for
/// all OSes but Linux-based ones, for which it's `~/.vendord`.
/// There is only one config file at `vendord.toml`, and we want to have the
/// database in the same folder as the configuration file, but for Linux the
/// XDG specifies a data directory (`~/.local/share/`) different from the
/// configuration one (`~/.config/`).
pub fn config_folder_path() -> Result<PathBuf, ConfigError> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    if let Some(mut path) = configs_dir {
        #[cfg(target_os = "linux")]
        path.push(".vendord");

        #[cfg(not(target_os = "linux"))]
        path.push("Vendord");

        return Ok(path);
    }

    Err(ConfigError(
        "Could not locate the configuration directory.".to_owned(),
    ))
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    config_folder_path().map(|mut path| {
        path.push("vendord.toml");
        path
    })
}

impl Config {
    /// Get our static configuration out of a mandatory configuration file.
    ///
    /// We require all settings to be set in the configuration file, and only
    /// in the configuration file. We don't allow to set them via the command
    /// line or environment variables to avoid a futile duplication.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file = custom_path.unwrap_or(config_file_path()?);

        let config = std::fs::read(&config_file)
            .map_err(|e| ConfigError(format!("Reading configuration file: {}", e)))
            .and_then(|file_content| {
                toml::from_slice::<Config>(&file_content)
                    .map_err(|e| ConfigError(format!("Parsing configuration file: {}", e)))
            })?;

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(10))
    }

    pub fn backoff_secs(&self) -> u64 {
        self.backoff_secs.unwrap_or(10)
    }

    pub fn checkpoint_interval(&self) -> u32 {
        self.checkpoint_interval.unwrap_or(10)
    }

    pub fn start_height(&self) -> u32 {
        self.start_height.unwrap_or(0)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(100)
    }
}
