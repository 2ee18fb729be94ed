/*!
 * Attach And Debugger Exit Tests
 */

use objbroker::debugger::{
    debug_process, debugger_attach, debugger_detach, generate_debug_event, set_kill_on_exit,
    set_process_debugger, wait_debug_event, DebugWait, EventSource, EventState,
};
use objbroker::process::{Process, ProcessTable, Thread};
use objbroker::{ServerError, Status};
use pretty_assertions::assert_eq;
use std::rc::Rc;

fn started(table: &ProcessTable) -> (Rc<Process>, Rc<Thread>) {
    let process = table.new_process();
    let thread = table.new_thread(&process, 0x7ffd_0000, 0x40_1000).unwrap();
    process.set_init_done();
    (process, thread)
}

#[test]
fn test_second_debugger_is_refused() {
    let table = ProcessTable::new(64, true);
    let (_p1, first) = started(&table);
    let (_p2, second) = started(&table);
    let (target, _t) = started(&table);

    debugger_attach(&target, &first, true).unwrap();
    assert_eq!(target.suspend_count(), 1);
    assert!(target.is_debugged());

    let err = debugger_attach(&target, &second, true).unwrap_err();
    assert_eq!(err.status(), Status::ACCESS_DENIED);
    assert_eq!(target.suspend_count(), 1);
    assert!(Rc::ptr_eq(&target.debugger().unwrap(), &first));
}

#[test]
fn test_attach_refuses_self_and_unstarted() {
    let table = ProcessTable::new(64, true);
    let (own, debugger) = started(&table);
    let err = debugger_attach(&own, &debugger, true).unwrap_err();
    assert_eq!(err.status(), Status::ACCESS_DENIED);

    let fresh = table.new_process();
    table.new_thread(&fresh, 0, 0).unwrap();
    assert!(debugger_attach(&fresh, &debugger, true).is_err());
    assert_eq!(fresh.suspend_count(), 0);
}

#[test]
fn test_debug_process_reports_state_and_breaks() {
    let table = ProcessTable::new(64, true);
    let (_dp, debugger) = started(&table);
    let (target, _t1) = started(&table);
    table.new_thread(&target, 0x7ffd_1000, 0x40_2000).unwrap();

    debug_process(&table, &debugger, target.id(), true).unwrap();
    let ctx = debugger.debug_ctx().unwrap();
    // create-process, create-thread, breakpoint
    assert_eq!(ctx.len(), 3);
    assert_eq!(target.suspend_count(), 3);

    let names: Vec<_> = ctx.events().iter().map(|e| e.payload().name()).collect();
    assert_eq!(names, vec!["create_process", "create_thread", "exception"]);
}

#[test]
fn test_debugger_exit_kills_debuggees() {
    let table = ProcessTable::new(64, true);
    let (debugger_process, debugger) = started(&table);
    let (target, _t) = started(&table);
    set_process_debugger(&target, &debugger, true);

    table.exit_thread(&debugger, 0);
    assert!(!debugger_process.is_running());
    assert_eq!(target.exit_code(), Some(Status::DEBUGGER_INACTIVE.0));
    assert!(table.get_process(target.id()).is_none());
}

#[test]
fn test_debugger_exit_detaches_when_asked() {
    let table = ProcessTable::new(64, true);
    let (_dp, debugger) = started(&table);
    let (target, thread) = started(&table);
    set_process_debugger(&target, &debugger, true);
    set_kill_on_exit(&debugger, false).unwrap();
    generate_debug_event(&thread, EventSource::ExitThread(0)).unwrap();
    assert_eq!(target.suspend_count(), 1);

    table.exit_thread(&debugger, 0);
    assert!(target.is_running());
    assert!(!target.is_debugged());
    assert!(target.debugger().is_none());
    assert_eq!(target.suspend_count(), 0);
}

#[test]
fn test_detach_balances_delivered_events() {
    let table = ProcessTable::new(64, true);
    let (_dp, debugger) = started(&table);
    let (target, t1) = started(&table);
    let t2 = table.new_thread(&target, 0x7ffd_1000, 0x40_2000).unwrap();
    set_process_debugger(&target, &debugger, true);

    let events: Vec<_> = [
        (&t1, EventSource::ExitThread(1)),
        (&t1, EventSource::UnloadDll(0x1000)),
        (&t2, EventSource::ExitThread(2)),
    ]
    .into_iter()
    .map(|(thread, source)| generate_debug_event(thread, source).unwrap().unwrap())
    .collect();
    // t1's first and t2's event go out, t1's second stays queued
    for _ in 0..2 {
        assert!(matches!(
            wait_debug_event(&debugger, false, 4096).unwrap(),
            DebugWait::Event { .. }
        ));
    }
    assert_eq!(target.suspend_count(), 3);

    debugger_detach(&target, &debugger).unwrap();
    assert_eq!(target.suspend_count(), 0);
    assert!(!target.is_debugged());
    assert!(t1.debug_event().is_none());
    assert!(t2.debug_event().is_none());
    assert!(debugger.debug_ctx().unwrap().is_empty());
    for event in &events {
        assert_eq!(event.state(), EventState::Continued);
        assert_eq!(event.status(), Status::DBG_CONTINUE);
    }
}

#[test]
fn test_debugger_exit_releases_delivered_event() {
    let table = ProcessTable::new(64, true);
    let (_dp, debugger) = started(&table);
    let (target, thread) = started(&table);
    set_process_debugger(&target, &debugger, true);
    set_kill_on_exit(&debugger, false).unwrap();
    generate_debug_event(&thread, EventSource::ExitThread(0)).unwrap();
    wait_debug_event(&debugger, false, 4096).unwrap();

    table.exit_thread(&debugger, 0);
    assert!(target.is_running());
    assert!(!target.is_debugged());
    assert_eq!(target.suspend_count(), 0);
    assert!(thread.debug_event().is_none());
}

#[test]
fn test_failed_attach_is_unwound() {
    // two handles: enough for create-process, none left for create-thread
    let small = ProcessTable::new(2, true);
    let (dp, debugger) = started(&small);

    let table = ProcessTable::new(64, true);
    let (target, _t1) = started(&table);
    table.new_thread(&target, 0x7ffd_1000, 0x40_2000).unwrap();

    let err = debug_process(&table, &debugger, target.id(), true).unwrap_err();
    assert!(matches!(err, ServerError::NoMemory(_)));
    assert!(!target.is_debugged());
    assert!(target.debugger().is_none());
    assert_eq!(target.suspend_count(), 0);
    assert!(debugger.debug_ctx().unwrap().is_empty());
    assert_eq!(dp.handles().len(), 0);

    // the process can be attached again once there is room
    let (_other, second) = started(&table);
    debugger_attach(&target, &second, true).unwrap();
    assert_eq!(target.suspend_count(), 1);
}
