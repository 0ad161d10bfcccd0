//! End-to-end scenarios over the assembled service: version lifecycle, the
//! not-modified short-circuit, restore, run status plumbing and the
//! critical-section guarantees.

mod common;

use std::fs;
use std::sync::Arc;

use common::{dir_names, setup, tale_with_workspace, write_file};
use versionfs::error::VersionError;
use versionfs::paths;
use versionfs::runs::RunStatus;
use versionfs::snapshot;
use versionfs::store::Sort;

#[test]
fn create_then_delete_blocked_by_run() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("entrypoint.sh", "#!/bin/sh\n")]);

    let v1 = env.service.versions().create(&tale.id, Some("First Version"), false, false).unwrap();
    let r1 = env.service.runs().create(&v1.id, Some("run 1"), false).unwrap();

    // Version is pinned by the run.
    let err = env.service.versions().delete(&v1.id).unwrap_err();
    assert!(matches!(err, VersionError::VersionInUse));
    assert_eq!(err.http_status(), 461);

    // Deleting the run releases it.
    env.service.runs().delete(&r1.id).unwrap();
    env.service.versions().delete(&v1.id).unwrap();
    assert!(env.service.versions().load(&v1.id).is_err());
}

#[test]
fn not_modified_short_circuit_returns_existing_id() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);

    let v1 = env.service.versions().create(&tale.id, None, false, false).unwrap();
    let err = env.service.versions().create(&tale.id, None, false, true).unwrap_err();
    match err {
        VersionError::NotModified { version_id } => assert_eq!(version_id, v1.id),
        other => panic!("expected NotModified, got {}", other),
    }
}

#[test]
fn rename_collision_with_allow_rename() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);

    env.service.versions().create(&tale.id, Some("First Version"), false, false).unwrap();
    let second = env
        .service
        .versions()
        .create(&tale.id, Some("First Version"), true, true)
        .unwrap();
    assert_eq!(second.name, "First Version (1)");
}

#[test]
fn restore_wipes_and_relinks_workspace() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();

    // Reshape the workspace entirely and snapshot again.
    let ws = tale.workspace_path.clone();
    fs::remove_file(ws.join("a.txt")).unwrap();
    write_file(&ws.join("b/c.txt"), "nested");
    env.service.versions().create(&tale.id, Some("v2"), false, false).unwrap();

    env.service.versions().restore(&tale.id, &v1.id).unwrap();

    assert_eq!(dir_names(&ws), ["a.txt"]);
    let v1_copy = paths::workspace_dir(v1.fs_path.as_ref().unwrap()).join("a.txt");
    assert!(snapshot::same_file(&ws.join("a.txt"), &v1_copy).unwrap());
}

#[test]
fn run_status_transitions_and_status_file() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("run.sh", "#!/bin/sh\n")]);
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();
    let r1 = env.service.runs().create(&v1.id, Some("r1"), false).unwrap();

    assert_eq!(env.service.runs().get_status(&r1.id).unwrap(), (0, "UNKNOWN"));

    env.service.runs().set_status_code(&r1.id, 2).unwrap();
    assert_eq!(env.service.runs().get_status(&r1.id).unwrap(), (2, "RUNNING"));

    let status_file = paths::status_file(r1.fs_path.as_ref().unwrap());
    assert_eq!(fs::read_to_string(status_file).unwrap().trim_end(), "2 RUNNING");
}

#[test]
fn unique_names_among_live_children() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);

    for i in 0..4 {
        env.service
            .versions()
            .create(&tale.id, Some("Checkpoint"), true, i > 0)
            .unwrap();
    }

    let names: Vec<String> = env
        .service
        .versions()
        .list(&tale.id, Sort::created(), 0, 0)
        .unwrap()
        .into_iter()
        .map(|v| v.name)
        .collect();
    let mut deduped = names.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), names.len(), "duplicate names among {:?}", names);
}

#[test]
fn fs_path_invariant_for_live_records() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();
    let r1 = env.service.runs().create(&v1.id, Some("r1"), false).unwrap();

    for record in [&v1, &r1] {
        let path = record.fs_path.as_ref().unwrap();
        assert!(path.is_dir(), "{:?} missing", path);
        assert!(fs::read_dir(path).unwrap().next().is_some(), "{:?} empty", path);
    }
}

#[test]
fn reference_counts_match_live_runs() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();

    let r1 = env.service.runs().create(&v1.id, Some("r1"), false).unwrap();
    let r2 = env.service.runs().create(&v1.id, Some("r2"), false).unwrap();
    assert_eq!(env.service.versions().load(&v1.id).unwrap().ref_count, Some(2));

    env.service.runs().delete(&r1.id).unwrap();
    assert_eq!(env.service.versions().load(&v1.id).unwrap().ref_count, Some(1));

    let runs = env.service.runs().list(&tale.id, Sort::created(), 0, 0).unwrap();
    let pointing = runs.iter().filter(|r| r.run_version_id == Some(v1.id.clone())).count();
    assert_eq!(pointing as i64, 1);
    let _ = r2;
}

#[test]
fn snapshot_identity_holds_for_every_file() {
    let env = setup();
    let tale = tale_with_workspace(
        &env,
        "Tale",
        &[("a.txt", "alpha"), ("sub/b.txt", "beta"), ("sub/deep/c.txt", "gamma")],
    );
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();

    let version_ws = paths::workspace_dir(v1.fs_path.as_ref().unwrap());
    for rel in ["a.txt", "sub/b.txt", "sub/deep/c.txt"] {
        assert!(
            snapshot::same_file(&tale.workspace_path.join(rel), &version_ws.join(rel)).unwrap(),
            "{} lost hard-link identity",
            rel
        );
    }
}

#[test]
fn second_snapshot_after_change_links_unchanged_files() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("keep.txt", "kept"), ("swap.txt", "one")]);
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();

    let ws = tale.workspace_path.clone();
    fs::remove_file(ws.join("swap.txt")).unwrap();
    write_file(&ws.join("swap.txt"), "two");
    let v2 = env.service.versions().create(&tale.id, Some("v2"), false, false).unwrap();

    let v1_ws = paths::workspace_dir(v1.fs_path.as_ref().unwrap());
    let v2_ws = paths::workspace_dir(v2.fs_path.as_ref().unwrap());
    // The untouched file is the same inode across both versions; the
    // replaced one is not.
    assert!(snapshot::same_file(&v1_ws.join("keep.txt"), &v2_ws.join("keep.txt")).unwrap());
    assert!(!snapshot::same_file(&v1_ws.join("swap.txt"), &v2_ws.join("swap.txt")).unwrap());
}

#[test]
fn restore_then_create_round_trips_to_not_modified() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();

    write_file(&tale.workspace_path.join("later.txt"), "later");
    env.service.versions().create(&tale.id, Some("v2"), false, false).unwrap();

    env.service.versions().restore(&tale.id, &v1.id).unwrap();
    match env.service.versions().create(&tale.id, None, false, true) {
        Err(VersionError::NotModified { version_id }) => assert_eq!(version_id, v1.id),
        other => panic!("expected NotModified, got {:?}", other.map(|v| v.name)),
    }
}

#[test]
fn concurrent_creates_serialize_or_report_busy() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);
    let service = Arc::new(env.service);
    let barrier = Arc::new(std::sync::Barrier::new(2));

    let mut handles = Vec::new();
    for i in 0..2 {
        let service = Arc::clone(&service);
        let tale_id = tale.id.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            service.versions().create(&tale_id, Some(&format!("c{}", i)), true, false)
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(VersionError::BusyTryLater)))
        .count();
    assert_eq!(ok + busy, 2, "unexpected error kind in {:?}", results.iter().map(|r| r.as_ref().err().map(|e| e.to_string())).collect::<Vec<_>>());
    assert!(ok >= 1);

    // Exactly the successful creates exist, and the section is free again.
    let versions = service.versions().list(&tale.id, Sort::created(), 0, 0).unwrap();
    assert_eq!(versions.len(), ok);
    service.versions().create(&tale.id, Some("after"), true, false).unwrap();
}

#[test]
fn busy_root_rejects_create() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);
    let root_id = tale.versions_root_id.clone().unwrap();

    let hierarchy = env.service.versions().hierarchy().clone();
    let section = hierarchy.lock_root(&root_id).unwrap();

    let err = env.service.versions().create(&tale.id, Some("v1"), true, false).unwrap_err();
    assert!(matches!(err, VersionError::BusyTryLater));
    assert_eq!(err.http_status(), 409);

    drop(section);
    env.service.versions().create(&tale.id, Some("v1"), true, false).unwrap();
}

#[test]
fn trash_holds_deleted_directories() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();
    let r1 = env.service.runs().create(&v1.id, Some("r1"), false).unwrap();

    let run_dir = r1.fs_path.clone().unwrap();
    env.service.runs().delete(&r1.id).unwrap();
    let run_trash = paths::trash_dir(run_dir.parent().unwrap());
    assert!(run_trash.join(r1.id.as_str()).join("workspace").is_dir());

    let version_dir = v1.fs_path.clone().unwrap();
    env.service.versions().delete(&v1.id).unwrap();
    let version_trash = paths::trash_dir(version_dir.parent().unwrap());
    assert!(version_trash.join(v1.id.as_str()).join("manifest.json").is_file());
}

#[test]
fn terminal_job_events_are_final() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("run.sh", "#!/bin/sh\n")]);
    let v1 = env.service.versions().create(&tale.id, Some("v1"), false, false).unwrap();
    let r1 = env.service.runs().create(&v1.id, Some("r1"), false).unwrap();
    env.service.runs().start(&r1.id, None).unwrap();

    env.service.runs().apply_job_event(&r1.id, versionfs::jobs::JobStatus::Error).unwrap();
    assert_eq!(env.service.runs().get_status(&r1.id).unwrap(), (4, "FAILED"));

    for event in [
        versionfs::jobs::JobStatus::Running,
        versionfs::jobs::JobStatus::Success,
        versionfs::jobs::JobStatus::Queued,
    ] {
        env.service.runs().apply_job_event(&r1.id, event).unwrap();
        assert_eq!(env.service.runs().get_status(&r1.id).unwrap(), (4, "FAILED"));
    }

    // Runs in a terminal state remain deletable.
    env.service.runs().delete(&r1.id).unwrap();
    assert_eq!(env.service.versions().load(&v1.id).unwrap().ref_count, Some(0));
}

#[test]
fn invalid_names_rejected() {
    let env = setup();
    let tale = tale_with_workspace(&env, "Tale", &[("a.txt", "alpha")]);

    for bad in ["bad/name", ".", "..", "nul", "with\u{7}bell"] {
        let err = env.service.versions().create(&tale.id, Some(bad), true, false).unwrap_err();
        assert!(matches!(err, VersionError::InvalidName(_)), "{:?} accepted", bad);
        assert_eq!(err.http_status(), 400);
    }
}
