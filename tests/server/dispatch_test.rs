/*!
 * Dispatcher Tests
 * Requests routed through `Server::dispatch`
 */

use objbroker::core::bincode;
use objbroker::core::flags::{Access, CreateFlags, FileOptions};
use objbroker::core::types::ModuleInfo;
use objbroker::debugger::{DebugEventPayload, DebugWait};
use objbroker::fs::{AsyncParams, FdType, OpenParams};
use objbroker::{Handle, ProcessId, Reply, Request, Server, ServerConfig, ServerError, Status, ThreadId};
use pretty_assertions::assert_eq;

/// Thread id no process ever gets
const NOBODY: ThreadId = 0;

fn bootstrap(server: &Server) -> (ProcessId, ThreadId) {
    match server
        .dispatch(
            NOBODY,
            Request::NewProcess {
                debug: false,
                teb: 0x7ffd_0000,
                entry: 0x40_1000,
            },
        )
        .unwrap()
    {
        Reply::NewProcess {
            pid,
            tid,
            process,
            thread,
        } => {
            assert!(process.is_none());
            assert!(thread.is_none());
            (pid, tid)
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

fn handle(reply: Reply) -> Handle {
    match reply {
        Reply::Handle(handle) => handle,
        other => panic!("expected a handle, got {:?}", other),
    }
}

#[test]
fn test_bootstrap_and_new_thread() {
    let server = Server::new(ServerConfig::minimal());
    let (pid, tid) = bootstrap(&server);
    assert_eq!(pid % 4, 0);
    assert_eq!(tid % 4, 0);

    let reply = server
        .dispatch(tid, Request::NewThread { teb: 0, entry: 0 })
        .unwrap();
    let Reply::NewThread { tid: second, handle } = reply else {
        panic!("unexpected reply");
    };
    assert_ne!(second, tid);
    assert!(!handle.is_none());
    let process = server.processes().get_process(pid).unwrap();
    assert_eq!(process.thread_count(), 2);
}

#[test]
fn test_unknown_thread_is_invalid_parameter() {
    let server = Server::new(ServerConfig::minimal());
    let err = server
        .dispatch(0x9990, Request::CreateCompletion)
        .unwrap_err();
    assert_eq!(err.status(), Status::INVALID_PARAMETER);
}

#[test]
fn test_create_lock_and_close_file() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(ServerConfig::minimal());
    let (_pid, tid) = bootstrap(&server);

    let params = OpenParams {
        flags: CreateFlags::CREATE,
        access: Access::READ_DATA | Access::WRITE_DATA,
        options: FileOptions::SYNCHRONOUS,
        ..Default::default()
    };
    let file = handle(
        server
            .dispatch(
                tid,
                Request::CreateFile {
                    path: dir.path().join("data"),
                    params,
                },
            )
            .unwrap(),
    );
    assert!(dir.path().join("data").exists());

    let reply = server
        .dispatch(
            tid,
            Request::LockFile {
                handle: file,
                offset: 0,
                count: 100,
                shared: false,
                wait: false,
            },
        )
        .unwrap();
    assert!(matches!(
        reply,
        Reply::Lock {
            pending: false,
            overlapped: false,
            ..
        }
    ));

    server
        .dispatch(
            tid,
            Request::UnlockFile {
                handle: file,
                offset: 0,
                count: 100,
            },
        )
        .unwrap();
    server
        .dispatch(tid, Request::CloseHandle { handle: file })
        .unwrap();
    let err = server
        .dispatch(tid, Request::CloseHandle { handle: file })
        .unwrap_err();
    assert_eq!(err.status(), Status::INVALID_HANDLE);
}

/// FSCTL_DISMOUNT_VOLUME, needing no access bits
const DISMOUNT_VOLUME: u32 = 0x0009_0020;

#[test]
fn test_handle_fd_and_ioctl_replies_carry_file_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(ServerConfig::minimal());
    let (_pid, tid) = bootstrap(&server);

    let params = OpenParams {
        flags: CreateFlags::CREATE,
        access: Access::READ_DATA | Access::WRITE_DATA,
        options: FileOptions::SYNCHRONOUS_IO_NONALERT,
        ..Default::default()
    };
    let file = handle(
        server
            .dispatch(
                tid,
                Request::CreateFile {
                    path: dir.path().join("volume"),
                    params,
                },
            )
            .unwrap(),
    );

    let reply = server
        .dispatch(tid, Request::GetHandleFd { handle: file })
        .unwrap();
    let Reply::HandleFd {
        fd,
        kind,
        removable,
        options,
        access,
    } = reply
    else {
        panic!("unexpected reply");
    };
    assert_eq!(kind, FdType::File);
    assert!(!removable);
    assert_eq!(options, FileOptions::SYNCHRONOUS_IO_NONALERT);
    assert!(access.contains(Access::READ_DATA | Access::WRITE_DATA));
    drop(fd);

    let reply = server
        .dispatch(
            tid,
            Request::Ioctl {
                handle: file,
                code: DISMOUNT_VOLUME,
                params: AsyncParams::default(),
                data: Vec::new(),
            },
        )
        .unwrap();
    let Reply::Ioctl { wait, options } = reply else {
        panic!("unexpected reply");
    };
    assert!(wait.is_none());
    assert_eq!(options, FileOptions::SYNCHRONOUS_IO_NONALERT);

    let err = server
        .dispatch(tid, Request::GetHandleFd { handle: file })
        .unwrap_err();
    assert_eq!(err.status(), Status::VOLUME_DISMOUNTED);
}

#[test]
fn test_unsupported_ioctl_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::new(ServerConfig::minimal());
    let (_pid, tid) = bootstrap(&server);
    let params = OpenParams {
        flags: CreateFlags::CREATE,
        access: Access::READ_DATA,
        ..Default::default()
    };
    let file = handle(
        server
            .dispatch(
                tid,
                Request::CreateFile {
                    path: dir.path().join("plain"),
                    params,
                },
            )
            .unwrap(),
    );
    let err = server
        .dispatch(
            tid,
            Request::Ioctl {
                handle: file,
                code: 0x0009_0000,
                params: AsyncParams::default(),
                data: Vec::new(),
            },
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::NOT_SUPPORTED);
}

#[test]
fn test_socket_pair_and_completion() {
    let server = Server::new(ServerConfig::minimal());
    let (pid, tid) = bootstrap(&server);

    let reply = server
        .dispatch(
            tid,
            Request::CreateSocketPair {
                options: FileOptions::empty(),
            },
        )
        .unwrap();
    let Reply::SocketPair { first, second } = reply else {
        panic!("unexpected reply");
    };
    assert_ne!(first, second);
    let process = server.processes().get_process(pid).unwrap();
    assert_eq!(process.handles().len(), 2);

    let port = handle(server.dispatch(tid, Request::CreateCompletion).unwrap());
    let err = server
        .dispatch(tid, Request::RemoveCompletion { handle: port })
        .unwrap_err();
    assert!(matches!(err, ServerError::Pending));

    server
        .dispatch(
            tid,
            Request::SetCompletionInfo {
                handle: first,
                completion: port,
                key: 7,
            },
        )
        .unwrap();
    server
        .dispatch(
            tid,
            Request::AddFdCompletion {
                handle: first,
                cvalue: 9,
                status: Status::SUCCESS,
                information: 3,
            },
        )
        .unwrap();
    let Reply::Completion(msg) = server
        .dispatch(tid, Request::RemoveCompletion { handle: port })
        .unwrap()
    else {
        panic!("completion not queued");
    };
    assert_eq!(msg.key, 7);
    assert_eq!(msg.value, 9);
    assert_eq!(msg.information, 3);
}

#[test]
fn test_debugged_child_reports_startup() {
    let server = Server::new(ServerConfig::minimal());
    let (_dpid, debugger) = bootstrap(&server);

    let reply = server
        .dispatch(
            debugger,
            Request::NewProcess {
                debug: true,
                teb: 0x7ffd_0000,
                entry: 0x40_1000,
            },
        )
        .unwrap();
    let Reply::NewProcess { pid, tid, process, .. } = reply else {
        panic!("unexpected reply");
    };
    assert!(!process.is_none());
    let child = server.processes().get_process(pid).unwrap();
    assert!(child.is_debugged());
    assert_eq!(child.suspend_count(), 0);

    let wait = server
        .dispatch(debugger, Request::WaitDebugEvent { get_handle: false })
        .unwrap();
    assert!(matches!(
        wait,
        Reply::DebugEvent(DebugWait::NotReady { wait }) if wait.is_none()
    ));

    server
        .dispatch(
            tid,
            Request::InitProcessDone {
                module: ModuleInfo {
                    base: 0x40_0000,
                    ..Default::default()
                },
                exe_file: Handle::NONE,
                entry: 0x40_1000,
            },
        )
        .unwrap();
    assert_eq!(child.suspend_count(), 1);

    let reply = server
        .dispatch(debugger, Request::WaitDebugEvent { get_handle: false })
        .unwrap();
    let Reply::DebugEvent(DebugWait::Event {
        pid: from_pid,
        tid: from_tid,
        data,
    }) = reply
    else {
        panic!("unexpected reply");
    };
    assert_eq!((from_pid, from_tid), (pid, tid));
    let payload: DebugEventPayload = bincode::from_slice(&data).unwrap();
    match payload {
        DebugEventPayload::CreateProcess { base, start, .. } => {
            assert_eq!(base, 0x40_0000);
            assert_eq!(start, 0x40_1000);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let err = server
        .dispatch(
            debugger,
            Request::ContinueDebugEvent {
                pid,
                tid,
                status: Status::SUCCESS,
            },
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::INVALID_PARAMETER);

    server
        .dispatch(
            debugger,
            Request::ContinueDebugEvent {
                pid,
                tid,
                status: Status::DBG_CONTINUE,
            },
        )
        .unwrap();
    assert_eq!(child.suspend_count(), 0);
}
