//! Contract state: code, storage maps and per-height reverse deltas.

use crate::{ContractError, ContractResult};
use magna_core::{
    read_compact_size, write_compact_size, AddressKey, Hash256, SliceReader,
};
use std::collections::BTreeMap;

/// Identifier of a contract (a 160-bit key, like an address).
pub type ContractId = AddressKey;

/// The current state of one contract: its program plus its storage map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractInfo {
    /// The contract program.
    pub code: Vec<u8>,
    /// Key-value storage.
    pub storage: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ContractInfo {
    /// Create a contract with `code` and empty storage.
    pub fn with_code(code: Vec<u8>) -> Self {
        Self {
            code,
            storage: BTreeMap::new(),
        }
    }
}

/// The information needed to reverse one block's modification of one
/// contract: the previous value of every touched storage key, and whether
/// the block created the contract outright.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageDelta {
    /// Previous value per touched key; `None` means the key was absent.
    pub entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// The contract was created in this block; reversing removes it.
    pub created: bool,
}

impl StorageDelta {
    /// Diff `new` against `old`, producing the delta that turns `new`'s
    /// storage back into `old`'s.
    pub fn between(old: &BTreeMap<Vec<u8>, Vec<u8>>, new: &BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        let mut entries = BTreeMap::new();
        for (key, new_value) in new {
            match old.get(key) {
                Some(old_value) if old_value == new_value => {}
                Some(old_value) => {
                    entries.insert(key.clone(), Some(old_value.clone()));
                }
                None => {
                    entries.insert(key.clone(), None);
                }
            }
        }
        for (key, old_value) in old {
            if !new.contains_key(key) {
                entries.insert(key.clone(), Some(old_value.clone()));
            }
        }
        Self {
            entries,
            created: false,
        }
    }

    /// Whether the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.created
    }

    /// Apply the delta to `storage`, reversing the modification it
    /// records.
    pub fn apply_reverse(&self, storage: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        for (key, previous) in &self.entries {
            match previous {
                Some(value) => {
                    storage.insert(key.clone(), value.clone());
                }
                None => {
                    storage.remove(key);
                }
            }
        }
    }

    /// Encode for the height-entry payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.created as u8);
        write_compact_size(&mut buf, self.entries.len() as u64);
        for (key, value) in &self.entries {
            write_bytes(&mut buf, key);
            match value {
                Some(value) => {
                    buf.push(1);
                    write_bytes(&mut buf, value);
                }
                None => buf.push(0),
            }
        }
        buf
    }

    /// Decode a height-entry payload.
    pub fn decode(bytes: &[u8]) -> ContractResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let delta = Self::decode_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(ContractError::Corruption("trailing delta bytes".into()));
        }
        Ok(delta)
    }

    fn decode_from(reader: &mut SliceReader<'_>) -> ContractResult<Self> {
        let created = reader.read_u8()? != 0;
        let count = read_compact_size(reader)? as usize;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = read_bytes(reader)?;
            let value = match reader.read_u8()? {
                0 => None,
                _ => Some(read_bytes(reader)?),
            };
            entries.insert(key, value);
        }
        Ok(Self { entries, created })
    }
}

/// One retained per-height snapshot for a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightEntry {
    /// Height of the block that touched the contract.
    pub height: u32,
    /// Hash of that block.
    pub block_hash: Hash256,
    /// Reverse delta; `None` when the modification was vacuous.
    pub reverse_delta: Option<StorageDelta>,
}

/// The durable record per contract: current state plus the retained
/// snapshot history, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractRecord {
    /// Current contract state.
    pub info: ContractInfo,
    /// Retained per-height entries in ascending height order.
    pub heights: Vec<HeightEntry>,
}

impl ContractRecord {
    /// Encode for storage.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &self.info.code);
        write_compact_size(&mut buf, self.info.storage.len() as u64);
        for (key, value) in &self.info.storage {
            write_bytes(&mut buf, key);
            write_bytes(&mut buf, value);
        }
        write_compact_size(&mut buf, self.heights.len() as u64);
        for entry in &self.heights {
            write_compact_size(&mut buf, entry.height as u64);
            buf.extend_from_slice(entry.block_hash.as_bytes());
            match &entry.reverse_delta {
                Some(delta) => {
                    buf.push(1);
                    let encoded = delta.encode();
                    write_compact_size(&mut buf, encoded.len() as u64);
                    buf.extend_from_slice(&encoded);
                }
                None => buf.push(0),
            }
        }
        buf
    }

    /// Decode from storage.
    pub fn decode(bytes: &[u8]) -> ContractResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let code = read_bytes(&mut reader)?;
        let storage_len = read_compact_size(&mut reader)? as usize;
        let mut storage = BTreeMap::new();
        for _ in 0..storage_len {
            let key = read_bytes(&mut reader)?;
            let value = read_bytes(&mut reader)?;
            storage.insert(key, value);
        }
        let height_len = read_compact_size(&mut reader)? as usize;
        let mut heights = Vec::with_capacity(height_len);
        for _ in 0..height_len {
            let height = read_compact_size(&mut reader)? as u32;
            let block_hash = Hash256::from_bytes(reader.read_array_32()?);
            let reverse_delta = match reader.read_u8()? {
                0 => None,
                _ => {
                    let len = read_compact_size(&mut reader)? as usize;
                    Some(StorageDelta::decode(reader.read_bytes(len)?)?)
                }
            };
            heights.push(HeightEntry {
                height,
                block_hash,
                reverse_delta,
            });
        }
        if !reader.is_empty() {
            return Err(ContractError::Corruption(
                "trailing contract record bytes".into(),
            ));
        }
        Ok(Self {
            info: ContractInfo { code, storage },
            heights,
        })
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn read_bytes(reader: &mut SliceReader<'_>) -> ContractResult<Vec<u8>> {
    let len = read_compact_size(reader)? as usize;
    Ok(reader.read_bytes(len)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<Vec<u8>, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn delta_between_and_reverse_roundtrip() {
        let old = map(&[("a", "1"), ("b", "2"), ("gone", "x")]);
        let new = map(&[("a", "1"), ("b", "20"), ("c", "3")]);

        let delta = StorageDelta::between(&old, &new);
        assert_eq!(delta.entries.len(), 3);

        let mut storage = new.clone();
        delta.apply_reverse(&mut storage);
        assert_eq!(storage, old);
    }

    #[test]
    fn identical_maps_produce_empty_delta() {
        let state = map(&[("k", "v")]);
        let delta = StorageDelta::between(&state, &state);
        assert!(delta.is_empty());
    }

    #[test]
    fn delta_encoding_roundtrips() {
        let old = map(&[("x", "old")]);
        let new = map(&[("x", "new"), ("y", "added")]);
        let delta = StorageDelta::between(&old, &new);
        assert_eq!(StorageDelta::decode(&delta.encode()).unwrap(), delta);
    }

    #[test]
    fn contract_record_roundtrips() {
        let record = ContractRecord {
            info: ContractInfo {
                code: b"function main() return 1 end".to_vec(),
                storage: map(&[("counter", "7"), ("owner", "alice")]),
            },
            heights: vec![
                HeightEntry {
                    height: 3,
                    block_hash: Hash256::from_bytes([3; 32]),
                    reverse_delta: Some(StorageDelta {
                        entries: [(b"counter".to_vec(), Some(b"6".to_vec()))].into(),
                        created: false,
                    }),
                },
                HeightEntry {
                    height: 5,
                    block_hash: Hash256::from_bytes([5; 32]),
                    reverse_delta: None,
                },
            ],
        };
        assert_eq!(ContractRecord::decode(&record.encode()).unwrap(), record);
    }
}
