/*!
 * Deferred Close Tests
 * Descriptors parked on the inode and delete-on-close
 */

use objbroker::core::flags::{Access, CreateFlags, FileOptions, ShareMode};
use objbroker::fs::{lock_fd, unlock_fd, File, FileRegistry, OpenParams};
use objbroker::process::ProcessTable;
use objbroker::reactor::{PollFallback, Reactor};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::rc::Rc;

fn registry() -> Rc<FileRegistry> {
    FileRegistry::new(Reactor::new(Box::new(PollFallback)))
}

fn open(registry: &Rc<FileRegistry>, path: &Path, access: Access, options: FileOptions) -> Rc<File> {
    let params = OpenParams {
        flags: CreateFlags::CREATE,
        access,
        sharing: ShareMode::all(),
        options,
        ..Default::default()
    };
    File::open(registry, path, &params).unwrap()
}

#[test]
fn test_close_waits_for_last_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parked");
    let registry = registry();
    let table = ProcessTable::new(64, true);
    let owner = table.new_process();
    let rw = Access::READ_DATA | Access::WRITE_DATA;

    let locker = open(&registry, &path, rw, FileOptions::empty());
    let other = open(&registry, &path, rw, FileOptions::empty());
    let inode = locker.fd().inode().unwrap();
    lock_fd(locker.fd(), &owner, 0, 4, false, false).unwrap();

    drop(other);
    assert_eq!(inode.closed_count(), 1);
    assert_eq!(inode.open_fds().len(), 1);

    unlock_fd(locker.fd(), 0, 4).unwrap();
    assert_eq!(inode.closed_count(), 0);
}

#[test]
fn test_close_without_locks_is_immediate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain");
    let registry = registry();

    let a = open(&registry, &path, Access::READ_DATA, FileOptions::empty());
    let b = open(&registry, &path, Access::READ_DATA, FileOptions::empty());
    let inode = a.fd().inode().unwrap();
    drop(b);
    assert_eq!(inode.closed_count(), 0);
    assert_eq!(inode.open_fds().len(), 1);
}

#[test]
fn test_delete_on_close_unlinks_with_last_fd() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doomed");
    let registry = registry();

    let keeper = open(&registry, &path, Access::READ_DATA, FileOptions::empty());
    let doomed = open(
        &registry,
        &path,
        Access::READ_DATA | Access::DELETE,
        FileOptions::DELETE_ON_CLOSE,
    );

    drop(doomed);
    assert!(path.exists(), "unlink must wait for the other open");
    assert_eq!(keeper.fd().inode().unwrap().closed_count(), 1);

    drop(keeper);
    assert!(!path.exists());
    assert_eq!(registry.device_count(), 0);
}

#[test]
fn test_replaced_path_is_not_unlinked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replaced");
    let registry = registry();

    let doomed = open(
        &registry,
        &path,
        Access::READ_DATA | Access::DELETE,
        FileOptions::DELETE_ON_CLOSE,
    );
    std::fs::remove_file(&path).unwrap();
    std::fs::write(&path, b"new file").unwrap();

    drop(doomed);
    assert_eq!(std::fs::read(&path).unwrap(), b"new file");
}
