// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use proptest::prelude::*;

#[test]
fn empty_ring() {
    let ring = ReplayRing::new(16);
    assert!(ring.is_empty());
    assert_eq!(ring.snapshot(), Vec::<u8>::new());
    assert_eq!(ring.total_appended(), 0);
}

#[test]
fn sequential_appends() {
    let mut ring = ReplayRing::new(16);
    ring.append(b"hello");
    ring.append(b" world");

    assert_eq!(ring.snapshot(), b"hello world".to_vec());
    assert_eq!(ring.len(), 11);
    assert_eq!(ring.total_appended(), 11);
}

#[test]
fn eviction_keeps_suffix() {
    let mut ring = ReplayRing::new(8);
    ring.append(b"abcdef");
    ring.append(b"ghij");

    // total=10, capacity=8: "ab" has been evicted
    assert_eq!(ring.snapshot(), b"cdefghij".to_vec());
    assert_eq!(ring.len(), 8);
    assert_eq!(ring.total_appended(), 10);
}

#[test]
fn oversized_append_keeps_last_capacity_bytes() {
    let mut ring = ReplayRing::new(4);
    ring.append(b"abcdefghij");
    assert_eq!(ring.snapshot(), b"ghij".to_vec());
    assert_eq!(ring.total_appended(), 10);
}

#[test]
fn tail_returns_most_recent_bytes() {
    let mut ring = ReplayRing::new(8);
    ring.append(b"abcdefgh");
    assert_eq!(ring.tail(3), b"fgh".to_vec());
    assert_eq!(ring.tail(100), b"abcdefgh".to_vec());
    assert_eq!(ring.tail(0), Vec::<u8>::new());
}

#[test]
fn tail_across_wrap_boundary() {
    let mut ring = ReplayRing::new(8);
    ring.append(b"abcdef");
    ring.append(b"ghij"); // wraps: retained = cdefghij
    assert_eq!(ring.tail(6), b"efghij".to_vec());
}

#[test]
fn read_from_offsets() {
    let mut ring = ReplayRing::new(8);
    ring.append(b"abcdef");
    ring.append(b"ghij"); // oldest retained offset is 2

    assert_eq!(ring.read_from(0), None);
    assert_eq!(ring.read_from(1), None);
    assert_eq!(ring.read_from(2), Some(b"cdefghij".to_vec()));
    assert_eq!(ring.read_from(6), Some(b"ghij".to_vec()));
    assert_eq!(ring.read_from(10), Some(vec![]));
    assert_eq!(ring.read_from(11), None);
}

#[test]
fn exact_capacity_append() {
    let mut ring = ReplayRing::new(4);
    ring.append(b"abcd");
    assert_eq!(ring.snapshot(), b"abcd".to_vec());
    ring.append(b"efgh");
    assert_eq!(ring.snapshot(), b"efgh".to_vec());
}

#[test]
fn zero_capacity_is_clamped() {
    let mut ring = ReplayRing::new(0);
    assert_eq!(ring.capacity(), 1);
    ring.append(b"xy");
    assert_eq!(ring.snapshot(), b"y".to_vec());
}

proptest! {
    /// The snapshot is always the suffix of everything appended, bounded
    /// by the capacity.
    #[test]
    fn snapshot_is_bounded_suffix(
        cap in 1usize..64,
        writes in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..48), 0..16),
    ) {
        let mut ring = ReplayRing::new(cap);
        let mut all = Vec::new();
        for w in &writes {
            ring.append(w);
            all.extend_from_slice(w);
        }

        let snap = ring.snapshot();
        prop_assert_eq!(ring.total_appended(), all.len() as u64);
        prop_assert_eq!(snap.len(), all.len().min(cap));
        prop_assert_eq!(&snap[..], &all[all.len() - snap.len()..]);
    }
}
