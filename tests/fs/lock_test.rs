/*!
 * Byte-Range Lock Tests
 * Conflicts, kernel lock bookkeeping and the hole sweep
 */

use nix::errno::Errno;
use objbroker::core::flags::{Access, CreateFlags, ShareMode};
use objbroker::core::types::FilePos;
use objbroker::fs::{
    compute_holes, lock_fd, unlock_fd, File, FileRegistry, LockOutcome, OpenParams, UnixLockKind,
    UnixLocks,
};
use objbroker::object::Object;
use objbroker::process::ProcessTable;
use objbroker::reactor::{PollFallback, Reactor};
use objbroker::Status;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::Rc;

type Calls = Rc<RefCell<Vec<(UnixLockKind, FilePos, FilePos)>>>;

/// Kernel lock layer that only records what it is asked to do
struct RecordingLocks {
    calls: Calls,
}

impl UnixLocks for RecordingLocks {
    fn set_lock(
        &self,
        _fd: RawFd,
        kind: UnixLockKind,
        start: FilePos,
        len: FilePos,
    ) -> Result<(), Errno> {
        self.calls.borrow_mut().push((kind, start, len));
        Ok(())
    }

    fn query_lock(&self, _fd: RawFd, _start: FilePos, _len: FilePos) -> Result<(), Errno> {
        Ok(())
    }
}

/// Kernel lock layer of a filesystem without lock support
struct UnsupportedLocks;

impl UnixLocks for UnsupportedLocks {
    fn set_lock(&self, _: RawFd, _: UnixLockKind, _: FilePos, _: FilePos) -> Result<(), Errno> {
        Err(Errno::ENOLCK)
    }

    fn query_lock(&self, _: RawFd, _: FilePos, _: FilePos) -> Result<(), Errno> {
        Err(Errno::ENOLCK)
    }
}

fn recording_registry() -> (Rc<FileRegistry>, Calls) {
    let calls = Calls::default();
    let registry = FileRegistry::with_locks(
        Reactor::new(Box::new(PollFallback)),
        Box::new(RecordingLocks {
            calls: calls.clone(),
        }),
    );
    (registry, calls)
}

fn open_rw(registry: &Rc<FileRegistry>, path: &Path) -> Rc<File> {
    let params = OpenParams {
        flags: CreateFlags::CREATE,
        access: Access::READ_DATA | Access::WRITE_DATA,
        sharing: ShareMode::all(),
        ..Default::default()
    };
    File::open(registry, path, &params).unwrap()
}

#[test]
fn test_release_keeps_range_still_covered() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, calls) = recording_registry();
    let table = ProcessTable::new(64, true);
    let owner = table.new_process();
    let file = open_rw(&registry, &dir.path().join("scenario-b"));

    assert!(matches!(
        lock_fd(file.fd(), &owner, 0, 100, false, false).unwrap(),
        LockOutcome::Granted
    ));
    assert!(matches!(
        lock_fd(file.fd(), &owner, 50, 100, false, false).unwrap(),
        LockOutcome::Granted
    ));
    assert_eq!(owner.lock_count(), 2);

    calls.borrow_mut().clear();
    unlock_fd(file.fd(), 0, 100).unwrap();

    assert_eq!(*calls.borrow(), vec![(UnixLockKind::Unlock, 0, 50)]);
    assert_eq!(owner.lock_count(), 1);
    assert_eq!(file.fd().inode().unwrap().lock_count(), 1);
}

#[test]
fn test_conflicting_lock_waits_or_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conflict");
    let (registry, _calls) = recording_registry();
    let table = ProcessTable::new(64, true);
    let (p1, p2) = (table.new_process(), table.new_process());
    let a = open_rw(&registry, &path);
    let b = open_rw(&registry, &path);

    lock_fd(a.fd(), &p1, 10, 10, false, false).unwrap();

    let err = lock_fd(b.fd(), &p2, 15, 1, true, false).err().unwrap();
    assert_eq!(err.status(), Status::FILE_LOCK_CONFLICT);

    let blocker = match lock_fd(b.fd(), &p2, 0, 0x100, false, true).unwrap() {
        LockOutcome::Pending(Some(lock)) => lock,
        _ => panic!("expected a pending lock with its blocker"),
    };
    assert_eq!(blocker.range(), (10, 20));
    assert!(!blocker.signaled());

    unlock_fd(a.fd(), 10, 10).unwrap();
    assert!(blocker.signaled());
    assert!(matches!(
        lock_fd(b.fd(), &p2, 0, 0x100, false, true).unwrap(),
        LockOutcome::Granted
    ));
}

#[test]
fn test_shared_locks_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared");
    let (registry, _calls) = recording_registry();
    let table = ProcessTable::new(64, true);
    let (p1, p2) = (table.new_process(), table.new_process());
    let a = open_rw(&registry, &path);
    let b = open_rw(&registry, &path);

    lock_fd(a.fd(), &p1, 0, 50, true, false).unwrap();
    assert!(matches!(
        lock_fd(b.fd(), &p2, 25, 50, true, false).unwrap(),
        LockOutcome::Granted
    ));
    assert!(lock_fd(b.fd(), &p2, 0, 1, false, false).is_err());
}

#[test]
fn test_unlock_needs_exact_range() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _calls) = recording_registry();
    let table = ProcessTable::new(64, true);
    let owner = table.new_process();
    let file = open_rw(&registry, &dir.path().join("exact"));

    lock_fd(file.fd(), &owner, 0, 100, false, false).unwrap();
    let err = unlock_fd(file.fd(), 0, 50).unwrap_err();
    assert_eq!(err.status(), Status::FILE_LOCK_CONFLICT);
    unlock_fd(file.fd(), 0, 100).unwrap();
    assert_eq!(owner.lock_count(), 0);
}

#[test]
fn test_wrapping_range_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _calls) = recording_registry();
    let table = ProcessTable::new(64, true);
    let owner = table.new_process();
    let file = open_rw(&registry, &dir.path().join("wrap"));

    let err = lock_fd(file.fd(), &owner, FilePos::MAX - 1, 10, false, false)
        .err()
        .unwrap();
    assert_eq!(err.status(), Status::INVALID_PARAMETER);

    // a range ending exactly at the top runs to end of file
    assert!(matches!(
        lock_fd(file.fd(), &owner, 100, FilePos::MAX - 99, false, false).unwrap(),
        LockOutcome::Granted
    ));
}

#[test]
fn test_process_exit_releases_its_locks() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, calls) = recording_registry();
    let table = ProcessTable::new(64, true);
    let owner = table.new_process();
    let thread = table.new_thread(&owner, 0, 0).unwrap();
    let file = open_rw(&registry, &dir.path().join("exit"));

    lock_fd(file.fd(), &owner, 0, 10, false, false).unwrap();
    lock_fd(file.fd(), &owner, 20, 10, true, false).unwrap();
    calls.borrow_mut().clear();

    table.exit_thread(&thread, 0);
    assert!(!owner.is_running());
    assert_eq!(file.fd().inode().unwrap().lock_count(), 0);
    let unlocks = calls
        .borrow()
        .iter()
        .filter(|c| c.0 == UnixLockKind::Unlock)
        .count();
    assert_eq!(unlocks, 2);
}

#[test]
fn test_unsupported_fs_falls_back_to_memory_locks() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FileRegistry::with_locks(
        Reactor::new(Box::new(PollFallback)),
        Box::new(UnsupportedLocks),
    );
    let table = ProcessTable::new(64, true);
    let owner = table.new_process();
    let file = open_rw(&registry, &dir.path().join("nolocks"));
    assert!(file.fd().fs_locks());

    lock_fd(file.fd(), &owner, 0, 10, false, false).unwrap();
    assert!(!file.fd().fs_locks());
    assert_eq!(owner.lock_count(), 1);
}

/// Release range minus the union of lock ranges, one byte at a time
fn holes_oracle(start: u64, end: u64, locks: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let covered = |pos: u64| {
        locks.iter().any(|&(s, e)| {
            if s == e && e != 0 {
                return false;
            }
            pos >= s && (e == 0 || pos < e)
        })
    };
    let mut holes = Vec::new();
    let mut open: Option<u64> = None;
    for pos in start..end {
        match (covered(pos), open) {
            (false, None) => open = Some(pos),
            (true, Some(s)) => {
                holes.push((s, pos));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(s) = open {
        holes.push((s, end));
    }
    holes
}

fn lock_range() -> impl Strategy<Value = (u64, u64)> {
    prop_oneof![
        (0u64..200, 1u64..80).prop_map(|(s, len)| (s, s + len)),
        (0u64..200).prop_map(|s| (s, s)),
        (0u64..200).prop_map(|s| (s, 0)),
    ]
}

proptest! {
    #[test]
    fn test_holes_match_interval_difference(
        start in 0u64..150,
        len in 1u64..100,
        locks in prop::collection::vec(lock_range(), 0..8),
    ) {
        let end = start + len;
        let mut expected = holes_oracle(start, end, &locks);
        let mut holes = compute_holes(start, end, locks.iter().copied());
        holes.sort_unstable();
        expected.sort_unstable();
        prop_assert_eq!(holes, expected);
    }

    #[test]
    fn test_abutting_locks_leave_release_range_whole(start in 10u64..100, len in 1u64..50) {
        let end = start + len;
        let locks = [(start - 10, start), (end, end + 10)];
        prop_assert_eq!(compute_holes(start, end, locks), vec![(start, end)]);
    }
}
