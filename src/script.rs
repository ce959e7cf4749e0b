//! Classification of the locking-script templates we know how to sign, the
//! binding key identifying our bridge instance, and transaction
//! canonicalization.

use bitcoin::blockdata::opcodes::{self, all::OP_CHECKMULTISIG};
use bitcoin::blockdata::script::{Instruction, Script};
use bitcoin::hashes::{hash160, ripemd160, Hash};
use bitcoin::{Transaction, Txid};

/// The script templates a signing request's inputs may be locked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptClass {
    /// A bare `m <keys> n OP_CHECKMULTISIG` script.
    Multisig,
    /// Pay-to-script-hash wrapping the shared redeem script.
    ScriptHash,
    /// Version-0 pay-to-witness-script-hash.
    WitnessScriptHash,
}

impl std::fmt::Display for ScriptClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ScriptClass::Multisig => write!(f, "multisig"),
            ScriptClass::ScriptHash => write!(f, "script-hash"),
            ScriptClass::WitnessScriptHash => write!(f, "witness-script-hash"),
        }
    }
}

/// Classify a locking script, or None if it matches no supported template.
pub fn classify(script: &Script) -> Option<ScriptClass> {
    if script.is_p2sh() {
        Some(ScriptClass::ScriptHash)
    } else if script.is_v0_p2wsh() {
        Some(ScriptClass::WitnessScriptHash)
    } else if is_multisig(script) {
        Some(ScriptClass::Multisig)
    } else {
        None
    }
}

fn push_num(instruction: &Instruction) -> Option<i32> {
    match instruction {
        Instruction::Op(op) => match op.classify() {
            opcodes::Class::PushNum(n) if n > 0 => Some(n),
            _ => None,
        },
        _ => None,
    }
}

fn is_multisig(script: &Script) -> bool {
    let instructions: Vec<Instruction> = match script.instructions().collect() {
        Ok(instructions) => instructions,
        Err(_) => return false,
    };
    if instructions.len() < 4 {
        return false;
    }

    let required = match push_num(&instructions[0]) {
        Some(n) => n,
        None => return false,
    };
    let total = match push_num(&instructions[instructions.len() - 2]) {
        Some(n) => n,
        None => return false,
    };
    match instructions[instructions.len() - 1] {
        Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
        _ => return false,
    }

    let keys = &instructions[1..instructions.len() - 2];
    if keys.len() != total as usize || required > total {
        return false;
    }
    keys.iter().all(|ins| match ins {
        Instruction::PushBytes(bytes) => bytes.len() == 33 || bytes.len() == 65,
        _ => false,
    })
}

/// The identifier of our bridge instance among many, derived from the shared
/// redeem script. Multiple custodians configured with the same script derive
/// the same key and thus watch the same notifications.
pub fn binding_key(script: &Script) -> Option<String> {
    let bytes = script.as_bytes();
    match classify(script)? {
        ScriptClass::Multisig => Some(hex::encode(&hash160::Hash::hash(bytes)[..])),
        ScriptClass::ScriptHash => Some(hex::encode(&bytes[2..22])),
        ScriptClass::WitnessScriptHash => {
            Some(hex::encode(&ripemd160::Hash::hash(&bytes[2..34])[..]))
        }
    }
}

/// Strip all unlocking material from a transaction's inputs, yielding the
/// stable identity of the signing independent of which or how many
/// signatures are attached.
pub fn canonicalize(tx: &Transaction) -> Transaction {
    let mut tx = tx.clone();
    for input in tx.input.iter_mut() {
        input.script_sig = Script::new();
        input.witness.clear();
    }
    tx
}

/// The key under which a signing is tracked, on chain and in the ledger.
pub fn canonical_txid(tx: &Transaction) -> Txid {
    canonicalize(tx).txid()
}
