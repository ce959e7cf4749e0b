//! Our global state, built once at startup from the configuration file.
//! Everything in here is fatal to get wrong: a daemon with a bad key, a bad
//! redeem script or an unusable data directory must not come up at all.

use crate::{
    config::{config_folder_path, Config, ConfigError, Mode},
    keys::{read_bitcoin_privkey, KeyError},
    script,
};

use bitcoin::{secp256k1::SecretKey as BitcoinPrivKey, Network, Script};

use std::{fs, io, os::unix::fs::DirBuilderExt, path::PathBuf};

/// An error occuring initializing our global state
#[derive(Debug)]
pub enum VendorDError {
    ConfigError(ConfigError),
    BitcoinKey(KeyError),
    /// The configured redeem script is not something we can derive a binding
    /// key from.
    RedeemScript(String),
    DatadirCreation(io::Error),
}

impl std::fmt::Display for VendorDError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::ConfigError(e) => write!(f, "Configuration error: '{}'", e),
            Self::BitcoinKey(e) => write!(f, "Bitcoin key error: '{}'", e),
            Self::RedeemScript(e) => write!(f, "Redeem script error: '{}'", e),
            Self::DatadirCreation(e) => write!(f, "Creating data directory: '{}'", e),
        }
    }
}

impl std::error::Error for VendorDError {}

/// Our global state
pub struct VendorD {
    pub network: Network,
    pub mode: Mode,
    pub bitcoin_privkey: BitcoinPrivKey,
    /// The multisig script shared by all custodians of this bridge instance.
    pub redeem_script: Script,
    /// Derived from the redeem script; tags the notifications meant for us.
    pub binding_key: String,

    // We store all our data in one place, that's here.
    pub data_dir: PathBuf,
}

pub fn create_datadir(datadir_path: &PathBuf) -> Result<(), std::io::Error> {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o700).recursive(true).create(datadir_path)
}

impl VendorD {
    pub fn from_config(config: &Config) -> Result<Self, VendorDError> {
        let redeem_bytes = hex::decode(&config.redeem_script)
            .map_err(|e| VendorDError::RedeemScript(format!("invalid hex: {}", e)))?;
        let redeem_script = Script::from(redeem_bytes);
        let binding_key = script::binding_key(&redeem_script).ok_or_else(|| {
            VendorDError::RedeemScript(
                "not a multisig, script-hash or witness-script-hash script".to_string(),
            )
        })?;

        let mut data_dir = match config.data_dir.clone() {
            Some(data_dir) => data_dir,
            None => config_folder_path().map_err(VendorDError::ConfigError)?,
        };
        if !data_dir.as_path().exists() {
            create_datadir(&data_dir).map_err(VendorDError::DatadirCreation)?;
        }
        data_dir = fs::canonicalize(data_dir).map_err(VendorDError::DatadirCreation)?;

        let mut bitcoin_key_path = data_dir.clone();
        bitcoin_key_path.push("bitcoin_secret");
        let bitcoin_privkey =
            read_bitcoin_privkey(&bitcoin_key_path).map_err(VendorDError::BitcoinKey)?;

        Ok(VendorD {
            network: config.network,
            mode: config.mode,
            bitcoin_privkey,
            redeem_script,
            binding_key,
            data_dir,
        })
    }

    fn file_from_datadir(&self, file_name: &str) -> PathBuf {
        let data_dir_str = self
            .data_dir
            .to_str()
            .expect("Impossible: the datadir path is valid unicode");

        [data_dir_str, file_name].iter().collect()
    }

    pub fn log_file(&self) -> PathBuf {
        self.file_from_datadir("log")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.file_from_datadir("vendord.pid")
    }

    pub fn db_file(&self) -> PathBuf {
        self.file_from_datadir("vendord.sqlite3")
    }
}
