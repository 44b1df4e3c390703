//! Locking scripts and destination extraction.
//!
//! Only the patterns the chain-state layer cares about are recognized:
//! pay-to-key-hash, pay-to-script-hash, contract invocation and
//! cross-branch transfer. Everything else is `Unresolved` and skipped by
//! the address index.

use crate::{hash160, AddressKey, Hash256};
use std::fmt;

/// OP_DUP.
const OP_DUP: u8 = 0x76;
/// OP_EQUAL.
const OP_EQUAL: u8 = 0x87;
/// OP_EQUALVERIFY.
const OP_EQUALVERIFY: u8 = 0x88;
/// OP_HASH160.
const OP_HASH160: u8 = 0xa9;
/// OP_CHECKSIG.
const OP_CHECKSIG: u8 = 0xac;
/// OP_RETURN.
const OP_RETURN: u8 = 0x6a;

/// Contract invocation marker.
pub const OP_CONTRACT: u8 = 0xc1;
/// Contract change-output marker.
pub const OP_CONTRACT_CHANGE: u8 = 0xc2;
/// Cross-branch transfer marker.
pub const OP_TRANS_BRANCH: u8 = 0xc3;

/// The destination a locking script resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Simple pay-to-key-hash address.
    KeyHash(AddressKey),
    /// Pay-to-script-hash address.
    ScriptHash(AddressKey),
    /// Contract invocation or change output.
    Contract(AddressKey),
    /// Cross-branch transfer; the key is HASH160 of the branch hash.
    BranchTransfer(AddressKey),
    /// No recognized pattern.
    Unresolved,
}

/// A serialized locking script.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Script(Vec<u8>);

impl Script {
    /// The empty script.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Wrap raw script bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Build a pay-to-key-hash script.
    pub fn pay_to_key_hash(key: &AddressKey) -> Self {
        let mut bytes = Vec::with_capacity(25);
        bytes.push(OP_DUP);
        bytes.push(OP_HASH160);
        bytes.push(20);
        bytes.extend_from_slice(key.as_bytes());
        bytes.push(OP_EQUALVERIFY);
        bytes.push(OP_CHECKSIG);
        Self(bytes)
    }

    /// Build a pay-to-script-hash script.
    pub fn pay_to_script_hash(hash: &AddressKey) -> Self {
        let mut bytes = Vec::with_capacity(23);
        bytes.push(OP_HASH160);
        bytes.push(20);
        bytes.extend_from_slice(hash.as_bytes());
        bytes.push(OP_EQUAL);
        Self(bytes)
    }

    /// Build a contract invocation script for `id`.
    pub fn contract(id: &AddressKey) -> Self {
        let mut bytes = Vec::with_capacity(22);
        bytes.push(OP_CONTRACT);
        bytes.push(20);
        bytes.extend_from_slice(id.as_bytes());
        Self(bytes)
    }

    /// Build a cross-branch transfer script for `branch_hash`.
    pub fn branch_transfer(branch_hash: &Hash256) -> Self {
        let mut bytes = Vec::with_capacity(34);
        bytes.push(OP_TRANS_BRANCH);
        bytes.push(32);
        bytes.extend_from_slice(branch_hash.as_bytes());
        Self(bytes)
    }

    /// Build an unspendable data-carrier script.
    pub fn op_return(data: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.push(OP_RETURN);
        bytes.push(data.len() as u8);
        bytes.extend_from_slice(data);
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Script length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the script is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the script is provably unspendable (data carrier).
    pub fn is_unspendable(&self) -> bool {
        self.0.first() == Some(&OP_RETURN)
    }

    /// Resolve the script to a destination.
    pub fn destination(&self) -> Destination {
        let b = &self.0;

        // Pay-to-key-hash: DUP HASH160 <20> EQUALVERIFY CHECKSIG.
        if b.len() == 25
            && b[0] == OP_DUP
            && b[1] == OP_HASH160
            && b[2] == 20
            && b[23] == OP_EQUALVERIFY
            && b[24] == OP_CHECKSIG
        {
            let key = AddressKey::from_slice(&b[3..23]).expect("20 bytes");
            return Destination::KeyHash(key);
        }

        // Pay-to-script-hash: HASH160 <20> EQUAL.
        if b.len() == 23 && b[0] == OP_HASH160 && b[1] == 20 && b[22] == OP_EQUAL {
            let key = AddressKey::from_slice(&b[2..22]).expect("20 bytes");
            return Destination::ScriptHash(key);
        }

        // Contract: OP_CONTRACT/OP_CONTRACT_CHANGE <20-byte id> ...
        if b.len() >= 22 && (b[0] == OP_CONTRACT || b[0] == OP_CONTRACT_CHANGE) && b[1] == 20 {
            let key = AddressKey::from_slice(&b[2..22]).expect("20 bytes");
            return Destination::Contract(key);
        }

        // Branch transfer: OP_TRANS_BRANCH <32-byte branch hash>. The
        // derived key is HASH160 of the branch hash.
        if b.len() >= 34 && b[0] == OP_TRANS_BRANCH && b[1] == 32 {
            return Destination::BranchTransfer(hash160(&b[2..34]));
        }

        Destination::Unresolved
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_roundtrip() {
        let key = AddressKey::from_bytes([0x11; 20]);
        let script = Script::pay_to_key_hash(&key);
        assert_eq!(script.destination(), Destination::KeyHash(key));
    }

    #[test]
    fn script_hash_is_distinguished() {
        let key = AddressKey::from_bytes([0x22; 20]);
        let script = Script::pay_to_script_hash(&key);
        assert_eq!(script.destination(), Destination::ScriptHash(key));
    }

    #[test]
    fn contract_script_resolves_to_contract() {
        let id = AddressKey::from_bytes([0x33; 20]);
        let script = Script::contract(&id);
        assert_eq!(script.destination(), Destination::Contract(id));
    }

    #[test]
    fn branch_transfer_derives_key_from_branch_hash() {
        let branch = Hash256::from_bytes([0x44; 32]);
        let script = Script::branch_transfer(&branch);
        let expected = hash160(branch.as_bytes());
        assert_eq!(script.destination(), Destination::BranchTransfer(expected));
    }

    #[test]
    fn garbage_is_unresolved() {
        assert_eq!(Script::new().destination(), Destination::Unresolved);
        let script = Script::from_bytes(vec![0x01, 0x02, 0x03]);
        assert_eq!(script.destination(), Destination::Unresolved);
    }

    #[test]
    fn op_return_is_unspendable() {
        assert!(Script::op_return(b"data").is_unspendable());
        assert!(!Script::pay_to_key_hash(&AddressKey::default()).is_unspendable());
    }
}
