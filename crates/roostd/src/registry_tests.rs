// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use yare::parameterized;

use crate::error::ErrorKind;

#[parameterized(
    plain = { "s1" },
    single_char = { "x" },
    dots_dashes = { "agent.worktree-7" },
    underscores = { "a_b_c" },
    max_len = { "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789.-" },
)]
fn valid_ids(id: &str) {
    assert!(validate_id(id).is_ok(), "{id:?} should be accepted");
}

#[parameterized(
    empty = { "" },
    too_long = { "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" },
    slash = { "a/b" },
    space = { "a b" },
    unicode = { "séance" },
    colon = { "a:b" },
)]
fn invalid_ids(id: &str) {
    let err = validate_id(id).err();
    assert!(err.is_some(), "{id:?} should be rejected");
    if let Some(err) = err {
        assert_eq!(err.kind, ErrorKind::StartFailed);
    }
}

#[test]
fn max_len_boundary() {
    let at_limit = "a".repeat(MAX_ID_LEN);
    let over_limit = "a".repeat(MAX_ID_LEN + 1);
    assert!(validate_id(&at_limit).is_ok());
    assert!(validate_id(&over_limit).is_err());
}

#[tokio::test]
async fn unknown_id_maps_to_not_found() {
    let registry = Registry::with_default_capacity();
    let err = registry.write("ghost", b"x").await.err();
    assert_eq!(err.map(|e| e.kind), Some(ErrorKind::NotFound));

    let err = registry.resize("ghost", 40, 80).err();
    assert_eq!(err.map(|e| e.kind), Some(ErrorKind::NotFound));

    let err = registry.stop("ghost").err();
    assert_eq!(err.map(|e| e.kind), Some(ErrorKind::NotFound));

    assert!(registry.list().is_empty());
    assert!(registry.is_empty());
}
