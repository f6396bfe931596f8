//! Property tests for chunking and tree building
//!
//! Uses small `max_blob`/`blob_bits` values so short generated inputs still
//! exercise many boundaries and several tree levels.

use cairn_core::config::SplitConfig;
use cairn_core::hashsplit::{join_to_vec, split_to_blob_or_tree, HashSplitter};
use cairn_core::object::{decode_loose, encode_loose, hash_object, ObjectKind};
use cairn_core::tree::{self, TreeEntry};
use cairn_core::{MemStore, Oid};
use proptest::prelude::*;

fn small_config() -> SplitConfig {
    SplitConfig {
        blob_bits: 6,
        max_blob: 512,
        fanout: 4,
        max_per_tree: 8,
        read_block: 300,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_chunks_reassemble(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let config = small_config();
        let chunks: Vec<_> = HashSplitter::single(data.as_slice(), &config)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        prop_assert_eq!(joined, data);
        for c in &chunks {
            prop_assert!(!c.data.is_empty());
            prop_assert!(c.data.len() <= config.max_blob);
        }
    }

    #[test]
    fn prop_chunking_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let config = small_config();
        let a: Vec<_> = HashSplitter::single(data.as_slice(), &config).unwrap().collect::<Result<_, _>>().unwrap();
        let b: Vec<_> = HashSplitter::single(data.as_slice(), &config).unwrap().collect::<Result<_, _>>().unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_tree_build_then_join(data in proptest::collection::vec(any::<u8>(), 0..16384)) {
        let config = small_config();
        let mut store = MemStore::new();
        let (_, oid) = split_to_blob_or_tree(&mut store, vec![data.as_slice()], &config).unwrap();
        prop_assert_eq!(join_to_vec(&store, &oid).unwrap(), data);
    }

    #[test]
    fn prop_hash_ignores_compression(
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        level in 0u32..=9,
    ) {
        let encoded = encode_loose(ObjectKind::Blob, &data, level).unwrap();
        let (kind, content) = decode_loose(&encoded).unwrap();
        prop_assert_eq!(kind, ObjectKind::Blob);
        prop_assert_eq!(hash_object(kind, &content), hash_object(ObjectKind::Blob, &data));
    }

    #[test]
    fn prop_tree_encoding_is_canonical(
        names in proptest::collection::btree_set("[a-z]{1,8}", 1..20),
        dirs in proptest::collection::vec(any::<bool>(), 20),
    ) {
        let entries: Vec<TreeEntry> = names
            .iter()
            .zip(&dirs)
            .enumerate()
            .map(|(i, (name, is_dir))| {
                let oid = Oid::from_bytes([i as u8; 20]);
                if *is_dir { TreeEntry::tree(name, oid) } else { TreeEntry::file(name, oid) }
            })
            .collect();
        let mut reversed = entries.clone();
        reversed.reverse();

        let once = tree::encode(&entries);
        prop_assert_eq!(&once, &tree::encode(&reversed));
        prop_assert_eq!(&once, &tree::encode(&tree::decode(&once).unwrap()));
    }
}
