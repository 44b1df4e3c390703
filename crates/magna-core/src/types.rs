//! Outpoints, transaction outputs and coins.

use crate::{
    read_varint, write_varint, CodecError, CodecResult, Hash256, Script, SliceReader,
};
use std::fmt;

/// Monetary amount in the smallest unit.
pub type Amount = i64;

/// Reference to a specific output of a specific transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    /// Hash of the creating transaction.
    pub txid: Hash256,
    /// Output index within that transaction.
    pub index: u32,
}

impl OutPoint {
    /// Create an outpoint.
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction output: an amount locked by a script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    /// Value in the smallest unit.
    pub amount: Amount,
    /// Locking script.
    pub script: Script,
}

impl TxOut {
    /// Create an output.
    pub fn new(amount: Amount, script: Script) -> Self {
        Self { amount, script }
    }

    /// The null output marking a spent coin: amount -1, empty script.
    pub fn null() -> Self {
        Self {
            amount: -1,
            script: Script::new(),
        }
    }

    /// Whether this is the null (spent) output.
    pub fn is_null(&self) -> bool {
        self.amount == -1 && self.script.is_empty()
    }
}

/// A live unspent output plus its origin metadata.
///
/// A spent coin carries the null output; spent coins are never written to
/// disk, they exist only transiently in the cache layers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coin {
    /// The output itself.
    pub out: TxOut,
    /// Height of the block that created the output.
    pub height: u32,
    /// Whether the creating transaction was a coinbase.
    pub is_coinbase: bool,
}

impl Coin {
    /// Create a live coin.
    pub fn new(out: TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            out,
            height,
            is_coinbase,
        }
    }

    /// Create a spent placeholder.
    pub fn spent() -> Self {
        Self {
            out: TxOut::null(),
            height: 0,
            is_coinbase: false,
        }
    }

    /// Mark this coin spent, releasing its script storage.
    pub fn clear(&mut self) {
        *self = Self::spent();
    }

    /// Whether the coin has been spent.
    pub fn is_spent(&self) -> bool {
        self.out.is_null()
    }

    /// Rough in-memory footprint, used by the cache byte accounting.
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.out.script.len()
    }

    /// Wire-encode for the coin database value.
    ///
    /// Layout: varint(height << 1 | coinbase) ‖ varint(amount) ‖
    /// varint(script length) ‖ script bytes. Spent coins are not
    /// serializable.
    pub fn consensus_encode(&self) -> Vec<u8> {
        assert!(!self.is_spent(), "refusing to serialize a spent coin");
        let mut buf = Vec::with_capacity(16 + self.out.script.len());
        let code = ((self.height as u64) << 1) | self.is_coinbase as u64;
        write_varint(&mut buf, code);
        write_varint(&mut buf, self.out.amount as u64);
        write_varint(&mut buf, self.out.script.len() as u64);
        buf.extend_from_slice(self.out.script.as_bytes());
        buf
    }

    /// Decode a coin database value.
    pub fn consensus_decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let code = read_varint(&mut reader)?;
        let height = u32::try_from(code >> 1).map_err(|_| CodecError::Malformed("coin height"))?;
        let is_coinbase = code & 1 == 1;
        let amount = read_varint(&mut reader)? as Amount;
        let script_len = read_varint(&mut reader)? as usize;
        let script = Script::from_bytes(reader.read_bytes(script_len)?.to_vec());
        if !reader.is_empty() {
            return Err(CodecError::Malformed("trailing bytes after coin"));
        }
        Ok(Self {
            out: TxOut::new(amount, script),
            height,
            is_coinbase,
        })
    }
}
