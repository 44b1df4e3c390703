//! Merkle tree helpers for block validation.
//!
//! The partial merkle tree proves inclusion of a subset of transactions in
//! a block. It is a depth-first encoding of the merkle tree pruned to the
//! matched leaves: one flag bit per visited node, plus the hash of every
//! node whose subtree is not descended into (and of every matched leaf).

use crate::{
    double_sha256, read_compact_size, write_compact_size, CodecError, CodecResult, Hash256,
    SliceReader,
};

/// Compute the merkle root of `leaves` (typically txids).
///
/// Bitcoin-style: nodes are double-SHA256 of the concatenated children and
/// an odd node is paired with itself. Empty input yields the zero hash.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut layer: Vec<Hash256> = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            let left = pair[0];
            let right = *pair.get(1).unwrap_or(&left);
            next.push(hash_nodes(&left, &right));
        }
        layer = next;
    }
    layer[0]
}

fn hash_nodes(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    double_sha256(&buf)
}

/// A merkle tree pruned down to a matched subset of transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialMerkleTree {
    /// Number of transactions in the full block.
    total: u32,
    /// Node hashes in depth-first order.
    hashes: Vec<Hash256>,
    /// Flag bits in depth-first order.
    bits: Vec<bool>,
    /// Set when deserialization or traversal found an inconsistency.
    bad: bool,
}

impl PartialMerkleTree {
    /// Build a partial tree over `txids` keeping the leaves where
    /// `matches` is true. The two slices must have equal length.
    pub fn from_txids(txids: &[Hash256], matches: &[bool]) -> Self {
        assert_eq!(txids.len(), matches.len(), "mask length mismatch");
        let mut tree = Self {
            total: txids.len() as u32,
            hashes: Vec::new(),
            bits: Vec::new(),
            bad: false,
        };
        let height = tree.tree_height();
        tree.build(height, 0, txids, matches);
        tree
    }

    /// Number of transactions in the block this tree describes.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Width of the tree at `height` (0 = leaves).
    fn tree_width(&self, height: u32) -> u32 {
        (self.total + (1 << height) - 1) >> height
    }

    /// Height of the full tree.
    fn tree_height(&self) -> u32 {
        let mut height = 0;
        while self.tree_width(height) > 1 {
            height += 1;
        }
        height
    }

    /// Hash of the node at (height, pos) computed from the full txid list.
    fn node_hash(&self, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.node_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            self.node_hash(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        hash_nodes(&left, &right)
    }

    /// Depth-first construction: emit one flag bit per node, descend only
    /// into subtrees containing a match, store hashes at the pruning
    /// frontier.
    fn build(&mut self, height: u32, pos: u32, txids: &[Hash256], matches: &[bool]) {
        let mut any_match = false;
        let lo = (pos << height) as usize;
        let hi = (((pos + 1) << height) as usize).min(self.total as usize);
        if lo < matches.len() {
            any_match = matches[lo..hi.min(matches.len())].iter().any(|&m| m);
        }
        self.bits.push(any_match);

        if height == 0 || !any_match {
            self.hashes.push(self.node_hash(height, pos, txids));
        } else {
            self.build(height - 1, pos * 2, txids, matches);
            if pos * 2 + 1 < self.tree_width(height - 1) {
                self.build(height - 1, pos * 2 + 1, txids, matches);
            }
        }
    }

    /// Depth-first extraction mirroring [`Self::build`].
    fn extract(
        &mut self,
        height: u32,
        pos: u32,
        bits_used: &mut usize,
        hashes_used: &mut usize,
        matched: &mut Vec<Hash256>,
        indices: &mut Vec<u32>,
    ) -> Hash256 {
        if *bits_used >= self.bits.len() {
            self.bad = true;
            return Hash256::ZERO;
        }
        let parent_of_match = self.bits[*bits_used];
        *bits_used += 1;

        if height == 0 || !parent_of_match {
            // Pruned subtree (or leaf): the hash is taken as-is.
            if *hashes_used >= self.hashes.len() {
                self.bad = true;
                return Hash256::ZERO;
            }
            let hash = self.hashes[*hashes_used];
            *hashes_used += 1;
            if height == 0 && parent_of_match {
                matched.push(hash);
                indices.push(pos);
            }
            hash
        } else {
            let left = self.extract(height - 1, pos * 2, bits_used, hashes_used, matched, indices);
            let right = if pos * 2 + 1 < self.tree_width(height - 1) {
                let right =
                    self.extract(height - 1, pos * 2 + 1, bits_used, hashes_used, matched, indices);
                if left == right {
                    // Identical children commit to an ambiguous tx set.
                    self.bad = true;
                }
                right
            } else {
                left
            };
            hash_nodes(&left, &right)
        }
    }

    /// Reconstruct the merkle root and collect the matched txids with
    /// their positions, in block order.
    ///
    /// Returns the zero hash when the tree is malformed: empty or
    /// oversized, inconsistent hash/bit counts, unconsumed suffix data, or
    /// the duplicate-child malleability pattern.
    pub fn extract_matches(&self, matched: &mut Vec<Hash256>, indices: &mut Vec<u32>) -> Hash256 {
        matched.clear();
        indices.clear();

        if self.total == 0 {
            return Hash256::ZERO;
        }
        // More transactions than fit a block at minimum tx size is bogus.
        if self.total > MAX_BLOCK_TXS {
            return Hash256::ZERO;
        }
        if self.hashes.len() > self.total as usize {
            return Hash256::ZERO;
        }
        if self.bits.len() < self.hashes.len() {
            return Hash256::ZERO;
        }

        let mut work = self.clone();
        let height = work.tree_height();
        let mut bits_used = 0;
        let mut hashes_used = 0;
        let root = work.extract(height, 0, &mut bits_used, &mut hashes_used, matched, indices);

        if work.bad {
            return Hash256::ZERO;
        }
        // Everything serialized must have been consumed, with at most 7
        // padding bits left over.
        if (bits_used + 7) / 8 != (work.bits.len() + 7) / 8 {
            return Hash256::ZERO;
        }
        if hashes_used != work.hashes.len() {
            return Hash256::ZERO;
        }
        root
    }

    /// Serialize: u32-le total, compact-size hash list, compact-size
    /// bit-packed flag bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.hashes.len() * 32 + self.bits.len() / 8);
        buf.extend_from_slice(&self.total.to_le_bytes());
        write_compact_size(&mut buf, self.hashes.len() as u64);
        for hash in &self.hashes {
            buf.extend_from_slice(hash.as_bytes());
        }
        let byte_len = (self.bits.len() + 7) / 8;
        write_compact_size(&mut buf, byte_len as u64);
        let mut packed = vec![0u8; byte_len];
        for (i, &bit) in self.bits.iter().enumerate() {
            if bit {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        buf.extend_from_slice(&packed);
        buf
    }

    /// Deserialize a tree produced by [`Self::serialize`].
    pub fn deserialize(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let total = reader.read_u32_le()?;
        let hash_count = read_compact_size(&mut reader)? as usize;
        let mut hashes = Vec::with_capacity(hash_count);
        for _ in 0..hash_count {
            hashes.push(Hash256::from_bytes(reader.read_array_32()?));
        }
        let byte_len = read_compact_size(&mut reader)? as usize;
        let packed = reader.read_bytes(byte_len)?;
        let mut bits = Vec::with_capacity(byte_len * 8);
        for i in 0..byte_len * 8 {
            bits.push(packed[i / 8] & (1 << (i % 8)) != 0);
        }
        if !reader.is_empty() {
            return Err(CodecError::Malformed("trailing bytes after merkle tree"));
        }
        Ok(Self {
            total,
            hashes,
            bits,
            bad: false,
        })
    }
}

/// Upper bound on transactions per block, used to reject bogus `total`
/// fields before allocating.
const MAX_BLOCK_TXS: u32 = 8_000_000 / 60;

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(n: u64) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        Hash256::from_bytes(bytes)
    }

    #[test]
    fn root_of_single_leaf_is_the_leaf() {
        let leaf = txid(7);
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn root_duplicates_odd_tail() {
        let a = txid(1);
        let b = txid(2);
        let c = txid(3);
        let ab = hash_nodes(&a, &b);
        let cc = hash_nodes(&c, &c);
        assert_eq!(merkle_root(&[a, b, c]), hash_nodes(&ab, &cc));
    }

    #[test]
    fn empty_set_has_zero_root() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
    }

    #[test]
    fn partial_tree_roundtrips_small() {
        let txids: Vec<Hash256> = (0..7).map(txid).collect();
        let matches = vec![false, true, false, false, true, false, true];
        let tree = PartialMerkleTree::from_txids(&txids, &matches);

        let bytes = tree.serialize();
        let back = PartialMerkleTree::deserialize(&bytes).unwrap();

        let mut matched = Vec::new();
        let mut indices = Vec::new();
        let root = back.extract_matches(&mut matched, &mut indices);
        assert_eq!(root, merkle_root(&txids));
        assert_eq!(matched, vec![txid(1), txid(4), txid(6)]);
        assert_eq!(indices, vec![1, 4, 6]);
    }

    #[test]
    fn no_matches_still_commits_to_root() {
        let txids: Vec<Hash256> = (0..5).map(txid).collect();
        let tree = PartialMerkleTree::from_txids(&txids, &[false; 5]);
        let mut matched = Vec::new();
        let mut indices = Vec::new();
        let root = tree.extract_matches(&mut matched, &mut indices);
        assert_eq!(root, merkle_root(&txids));
        assert!(matched.is_empty());
    }

    #[test]
    fn empty_tree_is_rejected() {
        let tree = PartialMerkleTree::from_txids(&[], &[]);
        let mut matched = Vec::new();
        let mut indices = Vec::new();
        assert!(tree
            .extract_matches(&mut matched, &mut indices)
            .is_zero());
    }
}
