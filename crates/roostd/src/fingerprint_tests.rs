// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use std::io::Write;

#[test]
fn fingerprint_is_16_lower_hex() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(b"some executable bytes")?;

    let fp = of_file(file.path())?;
    assert_eq!(fp.len(), FINGERPRINT_LEN);
    assert!(fp.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    assert!(is_valid(&fp));
    Ok(())
}

#[test]
fn same_contents_same_fingerprint() -> anyhow::Result<()> {
    let mut a = tempfile::NamedTempFile::new()?;
    let mut b = tempfile::NamedTempFile::new()?;
    a.write_all(b"identical")?;
    b.write_all(b"identical")?;

    assert_eq!(of_file(a.path())?, of_file(b.path())?);
    Ok(())
}

#[test]
fn different_contents_different_fingerprint() -> anyhow::Result<()> {
    let mut a = tempfile::NamedTempFile::new()?;
    let mut b = tempfile::NamedTempFile::new()?;
    a.write_all(b"build one")?;
    b.write_all(b"build two")?;

    assert_ne!(of_file(a.path())?, of_file(b.path())?);
    Ok(())
}

#[test]
fn missing_file_is_an_error() {
    assert!(of_file(std::path::Path::new("/nonexistent/roostd-fp")).is_err());
}

#[test]
fn current_exe_fingerprint_is_valid() -> anyhow::Result<()> {
    assert!(is_valid(&of_current_exe()?));
    Ok(())
}

#[test]
fn validity_checks() {
    assert!(is_valid("0123456789abcdef"));
    assert!(!is_valid("0123456789abcde")); // too short
    assert!(!is_valid("0123456789abcdef0")); // too long
    assert!(!is_valid("0123456789abcdeg")); // non-hex
}
