//! Partial merkle tree round-trip, size-bound and malleability tests.

use crate::generators::*;
use magna_core::merkle::{merkle_root, PartialMerkleTree};
use magna_core::Hash256;
use rand::Rng;

/// Number of tree levels for `n` transactions, counting the root level.
fn tree_levels(n: usize) -> usize {
    let mut levels = 1;
    let mut width = n;
    while width > 1 {
        width = (width + 1) / 2;
        levels += 1;
    }
    levels
}

/// Byte offset and length of the serialized hash region, so damage can be
/// applied to a random hash byte.
fn hash_region(bytes: &[u8]) -> (usize, usize) {
    // u32 total, then a compact-size hash count.
    let (count, prefix_len) = match bytes[4] {
        n @ 0..=0xFC => (n as usize, 1),
        0xFD => (
            u16::from_le_bytes([bytes[5], bytes[6]]) as usize,
            3,
        ),
        _ => panic!("unexpectedly large hash count in test"),
    };
    (4 + prefix_len, count * 32)
}

/// The serialization grid from the node's original test suite: for a
/// spread of transaction counts and inclusion probabilities, the partial
/// tree obeys its size bound, round-trips exactly, and breaks under any
/// single-bit damage to a serialized hash.
#[test]
fn partial_tree_grid_roundtrips_and_rejects_damage() {
    const TX_COUNTS: [usize; 12] = [1, 4, 7, 17, 56, 100, 127, 256, 312, 513, 1000, 4095];

    let mut rng = seeded_rng(0x706D74);
    for &total in &TX_COUNTS {
        let txids = random_txids(&mut rng, total);
        let root = merkle_root(&txids);
        let levels = tree_levels(total);

        for attempt in 1..15u32 {
            let mask = inclusion_mask(&mut rng, total, attempt / 2);
            let expected: Vec<Hash256> = txids
                .iter()
                .zip(&mask)
                .filter(|(_, &m)| m)
                .map(|(txid, _)| *txid)
                .collect();

            let tree = PartialMerkleTree::from_txids(&txids, &mask);
            let bytes = tree.serialize();

            // Size bound from the serialization format.
            let n = total.min(1 + expected.len() * levels);
            assert!(
                bytes.len() <= 10 + (258 * n + 7) / 8,
                "size bound violated for total={total} matched={}",
                expected.len()
            );

            let back = PartialMerkleTree::deserialize(&bytes).unwrap();
            let mut matched = Vec::new();
            let mut indices = Vec::new();
            let extracted_root = back.extract_matches(&mut matched, &mut indices);

            assert_eq!(extracted_root, root);
            assert!(!extracted_root.is_zero());
            assert_eq!(matched, expected, "matched txids out of order");
            for (txid, &index) in matched.iter().zip(&indices) {
                assert_eq!(txids[index as usize], *txid);
            }

            // Any single-bit flip in a serialized hash changes (or
            // invalidates) the reconstructed root.
            let (region_start, region_len) = hash_region(&bytes);
            for _ in 0..4 {
                let mut damaged = bytes.clone();
                let bit = rng.gen_range(0..region_len * 8);
                damaged[region_start + bit / 8] ^= 1 << (bit % 8);

                let tree = PartialMerkleTree::deserialize(&damaged).unwrap();
                let mut matched = Vec::new();
                let mut indices = Vec::new();
                let damaged_root = tree.extract_matches(&mut matched, &mut indices);
                assert_ne!(damaged_root, root, "damaged tree reproduced the root");
            }
        }
    }
}

/// Duplicate-leaf malleability: a tree whose matched subset straddles
/// duplicated leaves extracts to a null root.
#[test]
fn duplicated_leaves_are_rejected_as_malleable() {
    fn tagged(n: u8) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        Hash256::from_bytes(bytes)
    }

    // Positions 8 and 10 equal positions 9 and 11 respectively.
    let txids = vec![
        tagged(1),
        tagged(2),
        tagged(3),
        tagged(4),
        tagged(5),
        tagged(6),
        tagged(7),
        tagged(8),
        tagged(9),
        tagged(10),
        tagged(9),
        tagged(10),
    ];
    let mut mask = vec![false; 12];
    mask[9] = true;
    mask[10] = true;

    let tree = PartialMerkleTree::from_txids(&txids, &mask);
    let mut matched = Vec::new();
    let mut indices = Vec::new();
    assert!(tree.extract_matches(&mut matched, &mut indices).is_zero());
}

/// The all-matched single-transaction tree: the root is the txid itself.
#[test]
fn single_transaction_tree() {
    let txid = Hash256::from_bytes([0x5A; 32]);
    let tree = PartialMerkleTree::from_txids(&[txid], &[true]);
    let mut matched = Vec::new();
    let mut indices = Vec::new();
    let root = tree.extract_matches(&mut matched, &mut indices);
    assert_eq!(root, txid);
    assert_eq!(matched, vec![txid]);
    assert_eq!(indices, vec![0]);
}

/// Truncated serializations are decode errors, not panics.
#[test]
fn truncated_serialization_is_an_error() {
    let txids: Vec<Hash256> = (0..5u8)
        .map(|n| Hash256::from_bytes([n; 32]))
        .collect();
    let tree = PartialMerkleTree::from_txids(&txids, &[true, false, false, true, false]);
    let bytes = tree.serialize();

    for cut in [0, 3, 5, bytes.len() - 1] {
        assert!(PartialMerkleTree::deserialize(&bytes[..cut]).is_err());
    }
}
