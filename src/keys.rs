//! Loading of the signing credential. How the secret gets provisioned and
//! protected on disk is the deployment's business; we only require that the
//! file yields a valid secp256k1 key at startup, and refuse to start
//! otherwise.

use bitcoin::secp256k1::{Error as SecpError, SecretKey as BitcoinPrivKey};

use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
};

/// An error occuring during the handling of our keys
#[derive(Debug)]
pub enum KeyError {
    BitcoinRead(io::Error),
    /// Returned if the file does not contain a valid Secp256k1 private key
    BitcoinVerify(SecpError),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::BitcoinRead(e) => write!(f, "Bitcoin key read error: '{}'", e),
            Self::BitcoinVerify(e) => write!(f, "Bitcoin key verification error: '{}'", e),
        }
    }
}

impl std::error::Error for KeyError {}

// The Bitcoin key is hot (for now) but is part of the onchain Script and is
// generated during the setup Ceremony.
pub fn read_bitcoin_privkey(secret_file: &PathBuf) -> Result<BitcoinPrivKey, KeyError> {
    // 0xffffff....ffff is not a valid privkey so this ensures we read correctly.
    let mut buf = [0xff; 32];

    let mut bitcoin_secret_fd = fs::File::open(secret_file).map_err(KeyError::BitcoinRead)?;
    bitcoin_secret_fd
        .read_exact(&mut buf)
        .map_err(KeyError::BitcoinRead)?;

    // FIXME: buf zeroization, mlock of the key, decent mem management
    BitcoinPrivKey::from_slice(&buf).map_err(KeyError::BitcoinVerify)
}
