//! The signing worker: turns a signing request into one signature per input,
//! hands them to the source chain's threshold-collection call and records
//! the outcome in the ledger.

use crate::{
    chain::{ChainError, SourceChain},
    codec::{SigningRecord, SigningRequest},
    ledger::Ledger,
    retry::{self, Backoff},
    script::{self, ScriptClass},
};

use bitcoin::{
    secp256k1::{self, Message, Secp256k1, SecretKey, SignOnly},
    util::bip143::SigHashCache,
    Address, Network, PublicKey, Script, SigHashType,
};
use chrono::Utc;

use std::sync::{mpsc::Receiver, Arc};

#[derive(Debug)]
pub enum SignError {
    /// An input's locking script matches no template we can sign for. The
    /// whole request is aborted, no partial submission.
    UnsupportedScript { input: usize },
    /// A witness input has no spent amount at its position.
    MissingAmount { input: usize },
    /// The threshold-collection call failed for a non-transient reason.
    Submission(ChainError),
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SignError::UnsupportedScript { input } => {
                write!(f, "unsupported locking script on input {}", input)
            }
            SignError::MissingAmount { input } => {
                write!(f, "no spent amount supplied for witness input {}", input)
            }
            SignError::Submission(e) => write!(f, "submitting signatures: {}", e),
        }
    }
}

impl std::error::Error for SignError {}

pub struct Signer<C: SourceChain> {
    chain: C,
    ledger: Arc<Ledger>,
    privkey: SecretKey,
    address: String,
    redeem_script: Script,
    binding_key: String,
    backoff: Backoff,
    secp: Secp256k1<SignOnly>,
}

impl<C: SourceChain> Signer<C> {
    pub fn new(
        chain: C,
        ledger: Arc<Ledger>,
        privkey: SecretKey,
        network: Network,
        redeem_script: Script,
        binding_key: String,
        backoff: Backoff,
    ) -> Self {
        let secp = Secp256k1::signing_only();
        let pubkey = PublicKey {
            compressed: true,
            key: secp256k1::PublicKey::from_secret_key(&secp, &privkey),
        };
        let address = Address::p2pkh(&pubkey, network).to_string();

        Signer {
            chain,
            ledger,
            privkey,
            address,
            redeem_script,
            binding_key,
            backoff,
            secp,
        }
    }

    /// Consume signing requests until the queue disconnects, which only
    /// happens on process shutdown.
    pub fn run(&self, requests: Receiver<SigningRequest>) {
        log::info!("signing as {}", self.address);
        while let Ok(request) = requests.recv() {
            // Failures are logged inside. A dropped request is not fatal:
            // the chain rescans after a crash redeliver it.
            let _ = self.sign(request);
        }
        log::info!("signing queue disconnected, stopping");
    }

    /// Sign every input of the request, submit the signatures and record the
    /// signing under its canonical key.
    pub fn sign(&self, request: SigningRequest) -> Result<(), SignError> {
        let key = script::canonical_txid(&request.tx);

        let signatures = match self.input_signatures(&request) {
            Ok(signatures) => signatures,
            Err(e) => {
                log::error!("cannot sign {}: {}", key, e);
                return Err(e);
            }
        };

        let submission = retry::while_transient(
            &self.backoff,
            "submitting signatures",
            ChainError::is_transient,
            || {
                self.chain.submit_signatures(
                    &self.binding_key,
                    &key[..],
                    &self.address,
                    &signatures,
                )
            },
        );
        let chain_txid = match submission {
            Ok(txid) => txid,
            Err(e) => {
                log::error!("giving up on submitting signatures for {}: {}", key, e);
                return Err(SignError::Submission(e));
            }
        };

        let record = SigningRecord {
            request,
            received_at: Utc::now(),
            completed: false,
        };
        // An I/O failure here is not retried: the record is rewritten
        // identically the next time the request is redelivered.
        if let Err(e) = self.ledger.put(&key, &record) {
            log::error!("recording signing {}: {}", key, e);
        }

        log::info!(
            "signed {} and submitted as source-chain tx {}",
            key,
            chain_txid
        );
        Ok(())
    }

    // One signature per input, dispatched on the locking script the contract
    // packed into the input's script_sig slot.
    fn input_signatures(&self, request: &SigningRequest) -> Result<Vec<Vec<u8>>, SignError> {
        let lock_scripts: Vec<Script> = request
            .tx
            .input
            .iter()
            .map(|input| input.script_sig.clone())
            .collect();
        let tx = script::canonicalize(&request.tx);

        let mut signatures = Vec::with_capacity(lock_scripts.len());
        let mut witness_hashes = SigHashCache::new(&tx);
        for (i, lock) in lock_scripts.iter().enumerate() {
            let sighash = match script::classify(lock) {
                Some(ScriptClass::Multisig) | Some(ScriptClass::ScriptHash) => {
                    tx.signature_hash(i, &self.redeem_script, SigHashType::All.as_u32())
                }
                Some(ScriptClass::WitnessScriptHash) => {
                    let value = request
                        .amounts
                        .get(i)
                        .copied()
                        .ok_or(SignError::MissingAmount { input: i })?;
                    witness_hashes.signature_hash(i, &self.redeem_script, value, SigHashType::All)
                }
                None => return Err(SignError::UnsupportedScript { input: i }),
            };

            let message = Message::from_slice(&sighash[..]).expect("sighash is 32 bytes");
            let mut signature = self
                .secp
                .sign(&message, &self.privkey)
                .serialize_der()
                .to_vec();
            signature.push(SigHashType::All.as_u32() as u8);
            signatures.push(signature);
        }

        Ok(signatures)
    }
}
