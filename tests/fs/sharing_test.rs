/*!
 * Sharing Check Tests
 * Both directions of the share-mode check, over every share combination
 */

use objbroker::core::flags::{Access, CreateFlags, ShareMode};
use objbroker::fs::{lock_fd, File, FileRegistry, LockOutcome, OpenParams};
use objbroker::process::ProcessTable;
use objbroker::reactor::{PollFallback, Reactor};
use objbroker::Status;
use std::path::Path;
use std::rc::Rc;

fn registry() -> Rc<FileRegistry> {
    FileRegistry::new(Reactor::new(Box::new(PollFallback)))
}

fn open(
    registry: &Rc<FileRegistry>,
    path: &Path,
    access: Access,
    sharing: ShareMode,
) -> objbroker::ServerResult<Rc<File>> {
    let params = OpenParams {
        flags: CreateFlags::CREATE,
        access,
        sharing,
        ..Default::default()
    };
    File::open(registry, path, &params)
}

/// Each right with the share bit that admits it
const RIGHTS: [(Access, ShareMode); 3] = [
    (Access::READ_DATA, ShareMode::READ),
    (Access::WRITE_DATA, ShareMode::WRITE),
    (Access::DELETE, ShareMode::DELETE),
];

#[test]
fn test_existing_share_mode_limits_new_access() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    for bits in 0..8u32 {
        let existing_share = ShareMode::from_bits_truncate(bits);
        for (i, (right, needed)) in RIGHTS.iter().enumerate() {
            let path = dir.path().join(format!("existing-{}-{}", bits, i));
            let _first = open(
                &registry,
                &path,
                Access::READ_DATA,
                existing_share | ShareMode::READ,
            )
            .unwrap();

            let second = open(&registry, &path, *right, ShareMode::all());
            let allowed = (existing_share | ShareMode::READ).contains(*needed);
            match second {
                Ok(_) => assert!(allowed, "share {:?} admitted {:?}", existing_share, right),
                Err(e) => {
                    assert!(!allowed, "share {:?} refused {:?}", existing_share, right);
                    assert_eq!(e.status(), Status::SHARING_VIOLATION);
                }
            }
        }
    }
}

#[test]
fn test_new_share_mode_must_admit_existing_access() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    for bits in 0..8u32 {
        let new_share = ShareMode::from_bits_truncate(bits);
        for (i, (right, needed)) in RIGHTS.iter().enumerate() {
            let path = dir.path().join(format!("new-{}-{}", bits, i));
            let _first = open(&registry, &path, *right, ShareMode::all()).unwrap();

            let second = open(
                &registry,
                &path,
                Access::READ_ATTRIBUTES,
                new_share,
            );
            let allowed = new_share.contains(*needed);
            match second {
                Ok(_) => assert!(allowed, "{:?} open kept despite share {:?}", right, new_share),
                Err(e) => {
                    assert!(!allowed, "{:?} open refused share {:?}", right, new_share);
                    assert_eq!(e.status(), Status::SHARING_VIOLATION);
                }
            }
        }
    }
}

#[test]
fn test_exclusive_open_blocks_reader_but_stays_usable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario-a");
    let registry = registry();
    let table = ProcessTable::new(64, true);
    let owner = table.new_process();

    let a = open(
        &registry,
        &path,
        Access::READ_DATA | Access::WRITE_DATA,
        ShareMode::empty(),
    )
    .unwrap();
    let err = open(&registry, &path, Access::READ_DATA, ShareMode::READ).unwrap_err();
    assert_eq!(err.status(), Status::SHARING_VIOLATION);

    let inode = a.fd().inode().unwrap();
    assert_eq!(inode.open_fds().len(), 1);
    assert!(a.fd().get_unix_fd().is_ok());
    let outcome = lock_fd(a.fd(), &owner, 0, 10, false, false).unwrap();
    assert!(matches!(outcome, LockOutcome::Granted));
    assert_eq!(inode.lock_count(), 1);
}
