// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use crate::store::{RowStatus, SessionRow};

#[test]
fn artifact_hook_writes_caller_bytes_at_the_workspace_root() -> anyhow::Result<()> {
    let workspace = tempfile::tempdir()?;
    let row = SessionRow {
        status: RowStatus::Running,
        ..SessionRow::new("s1", workspace.path())
    };

    let hook = ArtifactHook::new("agents.json", |row: &SessionRow| {
        Some(format!("{{\"session\":\"{}\"}}", row.id).into_bytes())
    });

    assert!(hook.write_for(&row)?);
    let written = std::fs::read_to_string(workspace.path().join("agents.json"))?;
    assert_eq!(written, "{\"session\":\"s1\"}");
    Ok(())
}

#[test]
fn artifact_hook_can_decline_a_session() -> anyhow::Result<()> {
    let workspace = tempfile::tempdir()?;
    let row = SessionRow::new("skipped", workspace.path());

    let hook = ArtifactHook::new("agents.json", |_: &SessionRow| None);
    assert!(!hook.write_for(&row)?);
    assert!(!workspace.path().join("agents.json").exists());
    Ok(())
}

#[test]
fn artifact_hook_reports_unwritable_workspaces() {
    let row = SessionRow::new("s1", "/nonexistent-roost-workspace");
    let hook = ArtifactHook::new("agents.json", |_: &SessionRow| Some(vec![1, 2, 3]));
    assert!(hook.write_for(&row).is_err());
}

#[test]
fn report_defaults_are_empty() {
    let report = ReconcileReport::default();
    assert!(report.readopted.is_empty());
    assert!(report.lost.is_empty());
    assert!(report.orphans.is_empty());
}
