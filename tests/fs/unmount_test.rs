/*!
 * Device Unmount Tests
 */

use objbroker::core::flags::{Access, CreateFlags, ShareMode};
use objbroker::fs::{
    fd_queue_async, open_fd, Async, AsyncKind, AsyncParams, Fd, FdOps, FdType, File,
    FileRegistry, OpenParams,
};
use objbroker::object::Object;
use objbroker::reactor::{PollFallback, Reactor};
use objbroker::{ServerResult, Status};
use pretty_assertions::assert_eq;
use std::os::unix::fs::MetadataExt;
use std::rc::Rc;

#[test]
fn test_unmount_wakes_reads_and_disables_fds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume-file");
    let registry = FileRegistry::new(Reactor::new(Box::new(PollFallback)));
    let params = OpenParams {
        flags: CreateFlags::CREATE,
        access: Access::READ_DATA,
        sharing: ShareMode::all(),
        ..Default::default()
    };
    let a = File::open(&registry, &path, &params).unwrap();
    let b = File::open(&registry, &path, &params).unwrap();
    let dev = std::fs::metadata(&path).unwrap().dev();

    let read = a
        .fd()
        .register_async(AsyncKind::Read, AsyncParams::default(), 64)
        .unwrap();
    assert!(read.is_queued());

    registry.unmount_device(dev).unwrap();
    assert_eq!(read.status(), Status::VOLUME_DISMOUNTED);
    assert!(!read.is_queued());
    assert!(read.signaled());

    // the client's retry picks up the dismount exactly once
    read.set_result(Status::PENDING, 0);
    let dismounts = read
        .notifications()
        .into_iter()
        .filter(|s| *s == Status::VOLUME_DISMOUNTED)
        .count();
    assert_eq!(dismounts, 1);

    // the device is gone; a second unmount finds nothing
    assert!(registry.lookup_device(dev).is_none());
    registry.unmount_device(dev).unwrap();
    assert_eq!(read.notifications().len(), 2);

    for file in [&a, &b] {
        let err = file
            .fd()
            .register_async(AsyncKind::Read, AsyncParams::default(), 64)
            .err()
            .unwrap();
        assert_eq!(err.status(), Status::VOLUME_DISMOUNTED);
        assert_eq!(file.fd().no_fd_status(), Status::VOLUME_DISMOUNTED);
        assert!(file.fd().get_unix_fd().is_err());
    }
    drop(a);
    drop(b);
    assert!(path.exists());
}

/// Requests wait for the device instead of completing at once
struct HeldOps;

impl FdOps for HeldOps {
    fn get_fd_type(&self, _fd: &Fd) -> FdType {
        FdType::Device
    }

    fn queue_async(
        &self,
        fd: &Rc<Fd>,
        params: AsyncParams,
        kind: AsyncKind,
        count: u32,
    ) -> ServerResult<Rc<Async>> {
        let (_queue, async_) = fd_queue_async(fd, params, kind, count);
        Ok(async_)
    }
}

#[test]
fn test_unmount_notifies_pending_read_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("held");
    let registry = FileRegistry::new(Reactor::new(Box::new(PollFallback)));
    let params = OpenParams {
        flags: CreateFlags::CREATE,
        access: Access::READ_DATA,
        sharing: ShareMode::all(),
        ..Default::default()
    };
    let reader = open_fd(&registry, &path, &params, Box::new(HeldOps)).unwrap();
    let idle = open_fd(&registry, &path, &params, Box::new(HeldOps)).unwrap();
    let dev = std::fs::metadata(&path).unwrap().dev();

    let read = reader
        .register_async(AsyncKind::Read, AsyncParams::default(), 16)
        .unwrap();
    assert_eq!(read.status(), Status::PENDING);
    assert!(read.notifications().is_empty());

    registry.unmount_device(dev).unwrap();
    assert_eq!(read.notifications(), vec![Status::VOLUME_DISMOUNTED]);
    assert!(!read.is_queued());
    assert!(read.signaled());

    // nothing left to wake on either fd
    reader.async_wake_up(AsyncKind::Read, Status::VOLUME_DISMOUNTED);
    registry.unmount_device(dev).unwrap();
    assert_eq!(read.notifications().len(), 1);

    for fd in [&reader, &idle] {
        let err = fd.get_unix_fd().unwrap_err();
        assert_eq!(err.status(), Status::VOLUME_DISMOUNTED);
        assert_eq!(fd.no_fd_status(), Status::VOLUME_DISMOUNTED);
    }
}

#[test]
fn test_unmount_of_unknown_device_is_harmless() {
    let registry = FileRegistry::new(Reactor::new(Box::new(PollFallback)));
    registry.unmount_device(0xdead_beef).unwrap();
    assert_eq!(registry.device_count(), 0);
}

#[test]
fn test_fd_objects_survive_unmount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("survivor");
    let registry = FileRegistry::new(Reactor::new(Box::new(PollFallback)));
    let params = OpenParams {
        flags: CreateFlags::CREATE,
        ..Default::default()
    };
    let file = File::open(&registry, &path, &params).unwrap();
    let dev = std::fs::metadata(&path).unwrap().dev();
    let fd = Rc::clone(file.fd());

    registry.unmount_device(dev).unwrap();
    assert!(Rc::ptr_eq(&file.get_fd().unwrap(), &fd));
    assert!(fd.inode().is_some());
}
