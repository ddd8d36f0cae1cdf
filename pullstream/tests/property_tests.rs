//! Property-based tests for chunks and stream slicing.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use proptest::prelude::*;
use pullstream::{Chunk, Stream};

/// Strategy for small element vectors
fn values() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(any::<i32>(), 0..64)
}

/// Strategy for a chunk built by concatenating random pieces
fn chunk() -> impl Strategy<Value = Chunk<i32>> {
    prop::collection::vec(values(), 0..4)
        .prop_map(|parts| Chunk::concat_all(parts.into_iter().map(Chunk::from_vec)))
}

fn run<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    /// Concatenation is associative
    #[test]
    fn concat_is_associative(a in chunk(), b in chunk(), c in chunk()) {
        let left = a.clone().concat(b.clone()).concat(c.clone());
        let right = a.concat(b.concat(c));
        prop_assert_eq!(left.to_vec(), right.to_vec());
    }

    /// The empty chunk is an identity for concatenation
    #[test]
    fn concat_empty_is_identity(a in chunk()) {
        prop_assert_eq!(Chunk::empty().concat(a.clone()).to_vec(), a.to_vec());
        prop_assert_eq!(a.clone().concat(Chunk::empty()).to_vec(), a.to_vec());
    }

    /// Concatenation sizes add up
    #[test]
    fn concat_size_adds(a in chunk(), b in chunk()) {
        let expected = a.size() + b.size();
        prop_assert_eq!(a.concat(b).size(), expected);
    }

    /// take and drop partition a chunk
    #[test]
    fn chunk_take_drop_reconstructs(a in chunk(), n in 0usize..80) {
        let (head, tail) = a.split_at(n);
        prop_assert_eq!(head.size(), n.min(a.size()));
        prop_assert_eq!(head.concat(tail).to_vec(), a.to_vec());
    }

    /// Indexing agrees with the flattened vector
    #[test]
    fn chunk_indexing_matches_vec(a in chunk()) {
        let flat = a.to_vec();
        for (i, value) in flat.iter().enumerate() {
            prop_assert_eq!(a.get(i), Some(value));
        }
        prop_assert_eq!(a.get(flat.len()), None);
    }

    /// Stream take followed by drop gives back the whole stream
    #[test]
    fn stream_take_drop_reconstructs(parts in prop::collection::vec(values(), 0..6), n in 0usize..200) {
        let all: Vec<i32> = parts.iter().flatten().copied().collect();
        let source = move || {
            parts
                .iter()
                .cloned()
                .fold(Stream::empty(), |s, part| s.append(Stream::emits(part)))
        };
        let (head, tail) = run(async {
            let head = source().take(n).compile().to_vec().await.unwrap();
            let tail = source().drop(n).compile().to_vec().await.unwrap();
            (head, tail)
        });
        prop_assert_eq!(head.len(), n.min(all.len()));
        let mut joined = head;
        joined.extend(tail);
        prop_assert_eq!(joined, all);
    }

    /// Rechunking never changes the elements
    #[test]
    fn chunk_limit_preserves_elements(values in values(), limit in 1usize..10) {
        let out = run(async {
            Stream::emits(values.clone())
                .chunk_limit(limit)
                .chunks()
                .compile()
                .to_vec()
                .await
                .unwrap()
        });
        prop_assert!(out.iter().all(|c| c.size() <= limit && !c.is_empty()));
        let flat: Vec<i32> = out.iter().flat_map(|c| c.to_vec()).collect();
        prop_assert_eq!(flat, values);
    }
}
