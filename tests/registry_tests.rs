//! Tests for job records and the registry.

use std::sync::Arc;

use procwarden::logstore::log_buffer;
use procwarden::registry::{Job, JobState, Registry, RegistryError, StopDisposition};
use uuid::Uuid;

fn running_job(id: Uuid) -> Arc<Job> {
    let (_writer, log) = log_buffer();
    Arc::new(Job::running(
        id,
        "/bin/sleep".to_string(),
        vec!["60".to_string()],
        "alice".to_string(),
        4242,
        log,
    ))
}

#[test]
fn test_insert_and_get() {
    let registry = Registry::new();
    let id = Uuid::new_v4();
    registry.insert(running_job(id));

    let job = registry.get(id).unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.command, "/bin/sleep");
    assert_eq!(job.owner, "alice");
    assert_eq!(job.state(), JobState::Running);
}

#[test]
fn test_get_unknown_job() {
    let registry = Registry::new();
    let id = Uuid::new_v4();
    let err = registry.get(id).unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(found) if found == id));
}

#[test]
#[should_panic(expected = "duplicate job id")]
fn test_duplicate_insert_panics() {
    let registry = Registry::new();
    let id = Uuid::new_v4();
    registry.insert(running_job(id));
    registry.insert(running_job(id));
}

#[test]
fn test_list_returns_all_jobs() {
    let registry = Registry::new();
    registry.insert(running_job(Uuid::new_v4()));
    registry.insert(running_job(Uuid::new_v4()));
    assert_eq!(registry.list().len(), 2);
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_running_snapshot() {
    let job = running_job(Uuid::new_v4());
    let snap = job.snapshot();
    assert_eq!(snap.state, JobState::Running);
    assert_eq!(snap.pid, Some(4242));
    assert!(!snap.exited());
    assert!(snap.exit_code.is_none());
    assert!(snap.ended_at.is_none());
}

#[test]
fn test_begin_stop_transitions_once() {
    let job = running_job(Uuid::new_v4());

    assert_eq!(job.begin_stop(), StopDisposition::Signal { pid: 4242 });
    assert_eq!(job.state(), JobState::Stopping);

    // A second stop while the first is in flight is a no-op.
    assert_eq!(job.begin_stop(), StopDisposition::AlreadyStopping);
}

#[test]
fn test_stop_after_exit_reports_done() {
    let job = running_job(Uuid::new_v4());
    job.finalize(0, None);
    assert_eq!(job.begin_stop(), StopDisposition::AlreadyDone);
}

#[test]
fn test_finalize_sets_exit_fields() {
    let job = running_job(Uuid::new_v4());
    job.finalize(143, None);

    let snap = job.snapshot();
    assert!(snap.exited());
    assert_eq!(snap.state, JobState::Exited);
    assert_eq!(snap.exit_code, Some(143));
    assert!(snap.ended_at.is_some());
}

#[test]
fn test_failed_job_snapshot() {
    let (writer, log) = log_buffer();
    writer.close();
    let job = Job::failed(
        Uuid::new_v4(),
        "/nonexistent".to_string(),
        Vec::new(),
        "alice".to_string(),
        "spawn failed: no such file".to_string(),
        log,
    );

    let snap = job.snapshot();
    assert_eq!(snap.state, JobState::Failed);
    assert!(!snap.exited());
    assert!(snap.exit_code.is_none());
    assert!(snap.pid.is_none());
    assert!(snap.detail.unwrap().contains("spawn failed"));
    assert!(job.log.is_closed());
    assert_eq!(job.begin_stop(), StopDisposition::AlreadyDone);
}
