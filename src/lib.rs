/// The logic to parse our static config (source-chain endpoint, redeem
/// script, loop knobs, ..)
pub mod config;

/// The logic to initiate our main state
pub mod vendord;

/// Signing credential loading
pub mod keys;

/// Binary framing of the records we persist and ship between processes
pub mod codec;

/// Locking-script classification, binding key and canonicalization
pub mod script;

/// The source-chain RPC client and the notification schema
pub mod chain;

/// Named fixed-backoff retry policies
pub mod retry;

/// The block-event observer
pub mod observer;

/// The signing worker
pub mod signer;

/// The signing endpoint for split deployments
pub mod rest;

/// The signing ledger: persisted store and recency cache
pub mod ledger;

#[cfg(test)]
pub mod utils;
