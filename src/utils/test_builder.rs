//! A VendorTestBuilder type to simplify the setup and teardown needed for
//! tests: a throwaway data directory with a key file, a fresh multisig the
//! custodian participates in, canned transactions to sign and a source-chain
//! double that records what gets submitted.

use crate::{
    chain::{
        ChainError, ContractEvent, NotifyEntry, SourceChain, SIGN_COMPLETE_KEY, SIGN_REQUEST_KEY,
    },
    codec::{SigningRecord, SigningRequest},
    config::{Config, Mode},
    ledger::Ledger,
    script,
};

use bitcoin::{
    blockdata::{opcodes, script::Builder},
    consensus::encode,
    hashes::{hex::FromHex, Hash},
    secp256k1::{self, rand::thread_rng, Secp256k1, SecretKey},
    Address, Network, OutPoint, PublicKey, Script, Transaction, TxIn, TxOut, Txid,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    sync::Mutex,
};

/// A 5-of-7 multisig from a real bridge deployment, and a pending segwit
/// transaction redeeming from it.
pub const REDEEM_SCRIPT_HEX: &str = "552102dec9a415b6384ec0a9331d0cdf02020f0f1e5731c327b86e2b5a92455a289748210365b1066bcfa21987c3e207b92e309b95ca6bee5f1133cf04d6ed4ed265eafdbc21031104e387cd1a103c27fdc8a52d5c68dec25ddfb2f574fbdca405edfd8c5187de21031fdb4b44a9f20883aff505009ebc18702774c105cb04b1eecebcb294d404b1cb210387cda955196cc2b2fc0adbbbac1776f8de77b563c6d2a06a77d96457dc3d0d1f2102dd7767b6a7cc83693343ba721e0f5f4c7b4b8d85eeb7aec20d227625ec0f59d321034ad129efdab75061e8d4def08f5911495af2dae6d3e9a4b6e7aeb5186fa432fc57ae";
pub const PENDING_TX_HEX: &str = "01000000000101d102bf46072d5c36819d633e3e7685aa12ea870eeaa5ec1cce8165d324381b340100000000ffffffff02021b0000000000001976a91428d2e8cee08857f569e5a1b147c5d5e87339e08188ac2911000000000000220020216a09cb8ee51da1a91ea8942552d7936c886a10b507299003661816c0e9f18b0700473044022005ef849688c8f3612995f4b3eee91f06f0cd19d8c494c9518436cc5e74bf49de022036a2b2dd0101c9828e825f333c8b0f4a137455612b39e199846fb1f74dc231a401483045022100d634681163b3ac17fefa345298c995bf734ad5332dea43e262eb0b1f4a6a49c10220065283735f52f7c0d6b41f9f9f60c0ec0dfa07b3499607b0dee7b1501313eab90147304402206c3753c1e36860dc77d11a7b1ae6a54307fe306b6c6f69daaf150931d43c404d022060490dad039d1429e4dac03c96f0144f09fe90cafce448892afcca81e9aa4334014730440220281324bab36282a1b8a134f1ecff18f54386044b8eee199696fa33ff1022724e0220277d80e6bf9544d98036a5748cd034e51be4a936359c79db298d8cffb70a725101483045022100bb6bd929b3a2378fd79b6f16ed9f0314625e28eafc974718484490f1f4fc92e202200fe5b4f58a0a80d0c40ed69ed35e8452f7c2e0298f0b1143291e914f5cc934a601f1552102dec9a415b6384ec0a9331d0cdf02020f0f1e5731c327b86e2b5a92455a289748210365b1066bcfa21987c3e207b92e309b95ca6bee5f1133cf04d6ed4ed265eafdbc21031104e387cd1a103c27fdc8a52d5c68dec25ddfb2f574fbdca405edfd8c5187de21031fdb4b44a9f20883aff505009ebc18702774c105cb04b1eecebcb294d404b1cb210387cda955196cc2b2fc0adbbbac1776f8de77b563c6d2a06a77d96457dc3d0d1f2102dd7767b6a7cc83693343ba721e0f5f4c7b4b8d85eeb7aec20d227625ec0f59d321034ad129efdab75061e8d4def08f5911495af2dae6d3e9a4b6e7aeb5186fa432fc57ae00000000";
/// The binding key derived from [`REDEEM_SCRIPT_HEX`].
pub const BINDING_KEY: &str = "c330431496364497d7257839737b5e4596f5ac06";

static BUILDER_SEQ: AtomicUsize = AtomicUsize::new(0);

pub fn multisig_script(required: usize, pubkeys: &[PublicKey]) -> Script {
    let mut builder = Builder::new().push_int(required as i64);
    for pubkey in pubkeys {
        builder = builder.push_key(pubkey);
    }
    builder
        .push_int(pubkeys.len() as i64)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .into_script()
}

pub struct VendorTestBuilder {
    pub data_dir: PathBuf,
    pub privkey: SecretKey,
    pub pubkeys: Vec<PublicKey>,
    pub redeem_script: Script,
    pub secp: Secp256k1<secp256k1::All>,
}

impl VendorTestBuilder {
    /// A fresh `required`-of-`participants` multisig in which our generated
    /// key takes part, along with a throwaway data directory holding the key
    /// file.
    pub fn new(required: usize, participants: usize) -> Self {
        let secp = Secp256k1::new();
        let privkey = SecretKey::new(&mut thread_rng());

        let mut pubkeys = vec![PublicKey {
            compressed: true,
            key: secp256k1::PublicKey::from_secret_key(&secp, &privkey),
        }];
        for _ in 1..participants {
            let other = SecretKey::new(&mut thread_rng());
            pubkeys.push(PublicKey {
                compressed: true,
                key: secp256k1::PublicKey::from_secret_key(&secp, &other),
            });
        }
        let redeem_script = multisig_script(required, &pubkeys);

        let data_dir = std::env::temp_dir().join(format!(
            "vendord-test-{}-{}",
            std::process::id(),
            BUILDER_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&data_dir).expect("Creating test datadir");
        fs::write(data_dir.join("bitcoin_secret"), &privkey[..])
            .expect("Writing test bitcoin key");

        VendorTestBuilder {
            data_dir,
            privkey,
            pubkeys,
            redeem_script,
            secp,
        }
    }

    pub fn binding_key(&self) -> String {
        script::binding_key(&self.redeem_script).expect("a multisig always binds")
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir.join("vendord.sqlite3")
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::open(self.db_file()).expect("Opening test ledger")
    }

    pub fn config(&self) -> Config {
        Config {
            chain_rpc_url: "http://127.0.0.1:20336".to_string(),
            network: Network::Regtest,
            mode: Mode::All,
            redeem_script: hex::encode(self.redeem_script.as_bytes()),
            data_dir: Some(self.data_dir.clone()),
            log_level: None,
            poll_interval_secs: None,
            backoff_secs: None,
            checkpoint_interval: None,
            start_height: None,
            queue_capacity: None,
            signer_addr: None,
            listen: None,
        }
    }

    /// The canned pending transaction of [`PENDING_TX_HEX`].
    pub fn pending_tx(&self) -> Transaction {
        encode::deserialize(&Vec::from_hex(PENDING_TX_HEX).expect("valid fixture hex"))
            .expect("valid fixture transaction")
    }

    pub fn record_for_pending_tx(&self) -> SigningRecord {
        SigningRecord {
            request: SigningRequest {
                tx: self.pending_tx(),
                amounts: vec![11651],
            },
            received_at: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            completed: false,
        }
    }

    /// A minimal record with a distinct key and a receipt time strictly
    /// increasing in `seq`.
    pub fn dummy_record(&self, seq: u32) -> SigningRecord {
        let tx = Transaction {
            version: 1,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_slice(&[0x22; 32]).unwrap(),
                    vout: seq,
                },
                script_sig: Script::new(),
                sequence: 0xffffffff,
                witness: vec![],
            }],
            output: vec![],
        };
        SigningRecord {
            request: SigningRequest {
                tx,
                amounts: vec![],
            },
            received_at: Utc.timestamp_opt(1_600_000_000 + seq as i64, 0).unwrap(),
            completed: false,
        }
    }

    fn request_with_locks(&self, locks: Vec<Script>, amounts: Vec<u64>) -> SigningRequest {
        let tx = Transaction {
            version: 1,
            lock_time: 0,
            input: locks
                .into_iter()
                .enumerate()
                .map(|(i, lock)| TxIn {
                    previous_output: OutPoint {
                        txid: Txid::from_slice(&[0x33; 32]).unwrap(),
                        vout: i as u32,
                    },
                    script_sig: lock,
                    sequence: 0xffffffff,
                    witness: vec![],
                })
                .collect(),
            output: vec![TxOut {
                value: 10_000,
                script_pubkey: Script::new_p2sh(&self.redeem_script.script_hash()),
            }],
        };
        SigningRequest { tx, amounts }
    }

    /// One input per supported template: bare multisig, P2SH and P2WSH, the
    /// latter spending `witness_amount` satoshis.
    pub fn mixed_inputs_request(&self, witness_amount: u64) -> SigningRequest {
        let locks = vec![
            self.redeem_script.clone(),
            Script::new_p2sh(&self.redeem_script.script_hash()),
            Script::new_v0_wsh(&self.redeem_script.wscript_hash()),
        ];
        self.request_with_locks(locks, vec![0, 0, witness_amount])
    }

    /// A request whose second input is locked by a template we don't sign.
    pub fn p2pkh_input_request(&self) -> SigningRequest {
        let locks = vec![
            self.redeem_script.clone(),
            Address::p2pkh(&self.pubkeys[0], Network::Regtest).script_pubkey(),
        ];
        self.request_with_locks(locks, vec![0, 0])
    }
}

impl Drop for VendorTestBuilder {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.data_dir);
    }
}

/// The positional states array of a signing-request notification.
pub fn sign_request_states(binding_key: &str, raw_tx: &str, amounts: &[u64]) -> Value {
    json!([SIGN_REQUEST_KEY, binding_key, raw_tx, amounts])
}

/// The positional states array of a signing-complete notification.
pub fn sign_complete_states(binding_key: &str, raw_tx: &str) -> Value {
    json!([SIGN_COMPLETE_KEY, "", 0, raw_tx, 0, binding_key])
}

pub fn event_with(states: Vec<Value>) -> ContractEvent {
    ContractEvent {
        tx_hash: "1234".to_string(),
        state: 1,
        notifications: states
            .into_iter()
            .map(|states| NotifyEntry {
                contract_address: "1234".to_string(),
                states,
            })
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub binding_key: String,
    pub tx_hash: Vec<u8>,
    pub address: String,
    pub signatures: Vec<Vec<u8>>,
}

/// A source chain double: scripted heights and events, recorded submissions,
/// optional injected submission failures.
pub struct MockChain {
    height: Mutex<u32>,
    events: Mutex<HashMap<u32, Vec<ContractEvent>>>,
    submissions: Mutex<Vec<Submission>>,
    transient_failures: AtomicUsize,
    reject: AtomicBool,
}

impl MockChain {
    pub fn new(height: u32) -> Self {
        MockChain {
            height: Mutex::new(height),
            events: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            transient_failures: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
        }
    }

    pub fn set_height(&self, height: u32) {
        *self.height.lock().unwrap() = height;
    }

    pub fn add_event(&self, height: u32, event: ContractEvent) {
        self.events.lock().unwrap().entry(height).or_default().push(event);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    /// Make the next `n` submissions fail with a transport error.
    pub fn fail_transiently(&self, n: usize) {
        self.transient_failures.store(n, Ordering::Relaxed);
    }

    /// Make every submission fail with a non-transient RPC error.
    pub fn reject_submissions(&self) {
        self.reject.store(true, Ordering::Relaxed);
    }
}

impl SourceChain for MockChain {
    fn block_height(&self) -> Result<u32, ChainError> {
        Ok(*self.height.lock().unwrap())
    }

    fn events_at(&self, height: u32) -> Result<Vec<ContractEvent>, ChainError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .unwrap_or_default())
    }

    fn submit_signatures(
        &self,
        binding_key: &str,
        tx_hash: &[u8],
        address: &str,
        signatures: &[Vec<u8>],
    ) -> Result<String, ChainError> {
        if self.reject.load(Ordering::Relaxed) {
            return Err(ChainError::Rpc {
                code: 43,
                desc: "duplicate signature".to_string(),
            });
        }
        if self.transient_failures.load(Ordering::Relaxed) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(ChainError::Transport("connection refused".to_string()));
        }

        self.submissions.lock().unwrap().push(Submission {
            binding_key: binding_key.to_string(),
            tx_hash: tx_hash.to_vec(),
            address: address.to_string(),
            signatures: signatures.to_vec(),
        });
        Ok("mock-source-chain-txid".to_string())
    }
}
