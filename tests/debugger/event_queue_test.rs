/*!
 * Debug Event Queue Tests
 * Delivery order and handle atomicity
 */

use objbroker::core::flags::Access;
use objbroker::core::types::ModuleInfo;
use objbroker::debugger::{
    continue_debug_event, generate_debug_event, set_process_debugger, wait_debug_event, DebugWait,
    EventSource,
};
use objbroker::object::{Event, Object};
use objbroker::process::{Process, ProcessDll, ProcessTable, Thread};
use objbroker::{ServerError, Status};
use pretty_assertions::assert_eq;
use std::rc::Rc;

const REPLY_MAX: usize = 4096;

fn started(table: &ProcessTable) -> (Rc<Process>, Rc<Thread>) {
    let process = table.new_process();
    let thread = table.new_thread(&process, 0x7ffd_0000, 0x40_1000).unwrap();
    process.set_init_done();
    (process, thread)
}

fn delivered(wait: DebugWait) -> u32 {
    match wait {
        DebugWait::Event { tid, .. } => tid,
        other => panic!("expected an event, got {:?}", other),
    }
}

#[test]
fn test_one_outstanding_event_per_sender() {
    let table = ProcessTable::new(64, true);
    let (_dp, debugger) = started(&table);
    let (process, t1) = started(&table);
    let t2 = table.new_thread(&process, 0x7ffd_1000, 0x40_2000).unwrap();
    set_process_debugger(&process, &debugger, true);

    generate_debug_event(&t1, EventSource::ExitThread(1)).unwrap();
    generate_debug_event(&t1, EventSource::UnloadDll(0x1000)).unwrap();
    generate_debug_event(&t2, EventSource::ExitThread(2)).unwrap();
    assert_eq!(process.suspend_count(), 3);

    // t1's second event waits until its first is continued
    assert_eq!(delivered(wait_debug_event(&debugger, false, REPLY_MAX).unwrap()), t1.id());
    assert_eq!(delivered(wait_debug_event(&debugger, false, REPLY_MAX).unwrap()), t2.id());
    assert!(matches!(
        wait_debug_event(&debugger, false, REPLY_MAX).unwrap(),
        DebugWait::NotReady { .. }
    ));

    continue_debug_event(&debugger, process.id(), t1.id(), Status::DBG_CONTINUE).unwrap();
    assert_eq!(process.suspend_count(), 2);
    assert_eq!(delivered(wait_debug_event(&debugger, false, REPLY_MAX).unwrap()), t1.id());
}

#[test]
fn test_wait_handle_signals_when_event_arrives() {
    let table = ProcessTable::new(64, true);
    let (dp, debugger) = started(&table);
    let (process, thread) = started(&table);
    set_process_debugger(&process, &debugger, true);

    let DebugWait::NotReady { wait } = wait_debug_event(&debugger, true, REPLY_MAX).unwrap()
    else {
        panic!("queue should be empty");
    };
    assert!(!wait.is_none());
    let ctx = dp.handles().get(wait, Access::empty()).unwrap();
    assert!(!ctx.signaled());

    generate_debug_event(&thread, EventSource::ExitThread(0)).unwrap();
    assert!(ctx.signaled());
}

#[test]
fn test_continue_of_undelivered_event_is_denied() {
    let table = ProcessTable::new(64, true);
    let (_dp, debugger) = started(&table);
    let (process, thread) = started(&table);
    set_process_debugger(&process, &debugger, true);
    generate_debug_event(&thread, EventSource::ExitThread(0)).unwrap();

    let err = continue_debug_event(&debugger, process.id(), thread.id(), Status::DBG_CONTINUE)
        .unwrap_err();
    assert_eq!(err.status(), Status::ACCESS_DENIED);
    assert_eq!(process.suspend_count(), 1);
}

#[test]
fn test_create_process_event_is_all_or_nothing() {
    // room for the process and thread handles but not the image file
    let small = ProcessTable::new(2, true);
    let (dp, debugger) = started(&small);

    let table = ProcessTable::new(64, true);
    let (process, thread) = started(&table);
    let image: Rc<dyn Object> = Event::new(true, false);
    process.set_exe(ProcessDll::new(
        &ModuleInfo {
            base: 0x40_0000,
            ..Default::default()
        },
        Some(image),
    ));
    set_process_debugger(&process, &debugger, true);

    let err = generate_debug_event(&thread, EventSource::CreateProcess { entry: 0x40_1000 })
        .err()
        .unwrap();
    assert!(matches!(err, ServerError::NoMemory(_)));
    assert_eq!(dp.handles().len(), 0);
    assert!(debugger.debug_ctx().unwrap().is_empty());
    assert_eq!(process.suspend_count(), 0);
}
