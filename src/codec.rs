//! Binary framing for the two record types we persist and ship between
//! processes. The format is fixed big-endian and must stay stable across
//! versions: it is both the on-disk value format of the signing ledger and
//! the payload of the cross-process signing request.

use crate::script;

use bitcoin::{consensus::encode, Transaction, Txid};
use chrono::{DateTime, TimeZone, Utc};

use std::convert::TryInto;

/// A pending transaction this custodian was asked to co-sign, as decoded
/// from a source-chain notification. Each input carries the spent output's
/// locking script packed in its `script_sig` slot. `amounts` is indexed by
/// input position and is only consulted for witness-type inputs, whose
/// signature hash commits to the spent amount.
#[derive(Debug, Clone, PartialEq)]
pub struct SigningRequest {
    pub tx: Transaction,
    pub amounts: Vec<u64>,
}

/// One row of the signing ledger: the request we signed, when we received
/// it, and whether the signing was completed on the source chain. The
/// payload is write-once; only the completion flag is ever mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct SigningRecord {
    pub request: SigningRequest,
    pub received_at: DateTime<Utc>,
    pub completed: bool,
}

#[derive(PartialEq, Eq, Debug)]
pub enum CodecError {
    /// The buffer ended before the advertised length was read.
    UnexpectedEnd,
    /// The embedded transaction bytes don't consensus-decode.
    Transaction(String),
    /// The embedded timestamp is out of range.
    Timestamp,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CodecError::UnexpectedEnd => write!(f, "unexpected end of encoded record"),
            CodecError::Transaction(e) => write!(f, "decoding embedded transaction: {}", e),
            CodecError::Timestamp => write!(f, "embedded timestamp out of range"),
        }
    }
}

impl std::error::Error for CodecError {}

// Cursor over an encoded record, erroring instead of panicking on short
// buffers.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::UnexpectedEnd);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(
            self.take(4)?.try_into().expect("4 bytes were taken"),
        ))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(
            self.take(8)?.try_into().expect("8 bytes were taken"),
        ))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(
            self.take(8)?.try_into().expect("8 bytes were taken"),
        ))
    }
}

impl SigningRequest {
    /// `[u32 tx length][consensus-encoded tx][u32 count][count x u64 amount]`
    pub fn encode(&self) -> Vec<u8> {
        let tx = encode::serialize(&self.tx);
        let mut buf = Vec::with_capacity(tx.len() + 8 + self.amounts.len() * 8);
        buf.extend_from_slice(&(tx.len() as u32).to_be_bytes());
        buf.extend_from_slice(&tx);
        buf.extend_from_slice(&(self.amounts.len() as u32).to_be_bytes());
        for amount in &self.amounts {
            buf.extend_from_slice(&amount.to_be_bytes());
        }
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        Self::read(&mut Reader::new(raw))
    }

    fn read(r: &mut Reader) -> Result<Self, CodecError> {
        let tx_len = r.read_u32()? as usize;
        let tx = encode::deserialize(r.take(tx_len)?)
            .map_err(|e| CodecError::Transaction(e.to_string()))?;

        let count = r.read_u32()? as usize;
        // Bound the allocation by what the buffer can actually hold.
        let mut amounts = Vec::with_capacity(count.min(r.buf.len() / 8));
        for _ in 0..count {
            amounts.push(r.read_u64()?);
        }

        Ok(SigningRequest { tx, amounts })
    }
}

impl SigningRecord {
    /// The ledger key of this record: the canonical txid of its transaction.
    pub fn key(&self) -> Txid {
        script::canonical_txid(&self.request.tx)
    }

    /// `[u32 length][encoded request][u32 length][i64 secs + u32 nanos][u8 flag]`
    pub fn encode(&self) -> Vec<u8> {
        let request = self.request.encode();
        let mut buf = Vec::with_capacity(request.len() + 21);
        buf.extend_from_slice(&(request.len() as u32).to_be_bytes());
        buf.extend_from_slice(&request);

        buf.extend_from_slice(&12u32.to_be_bytes());
        buf.extend_from_slice(&self.received_at.timestamp().to_be_bytes());
        buf.extend_from_slice(&self.received_at.timestamp_subsec_nanos().to_be_bytes());

        buf.push(self.completed as u8);
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);

        let request_len = r.read_u32()? as usize;
        let request = SigningRequest::read(&mut Reader::new(r.take(request_len)?))?;

        let ts_len = r.read_u32()? as usize;
        let mut ts = Reader::new(r.take(ts_len)?);
        let secs = ts.read_i64()?;
        let nanos = ts.read_u32()?;
        let received_at = Utc
            .timestamp_opt(secs, nanos)
            .single()
            .ok_or(CodecError::Timestamp)?;

        let completed = r.read_u8()? != 0;

        Ok(SigningRecord {
            request,
            received_at,
            completed,
        })
    }
}
