/*!
 * Server Actor Tests
 */

use objbroker::{Reply, Request, ServerConfig, ServerHandle};
use std::thread;

fn new_process() -> Request {
    Request::NewProcess {
        debug: false,
        teb: 0,
        entry: 0,
    }
}

#[tokio::test]
async fn test_call_async_reaches_reactor_thread() {
    let (handle, join) = ServerHandle::spawn(ServerConfig::minimal()).unwrap();

    let Reply::NewProcess { tid, .. } = handle.call_async(0, new_process()).await.unwrap() else {
        panic!("bootstrap failed");
    };
    let reply = handle
        .call_async(tid, Request::CreateCompletion)
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Handle(h) if !h.is_none()));

    handle.shutdown();
    tokio::task::spawn_blocking(move || join.join())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[test]
fn test_handles_share_one_server() {
    let (handle, join) = ServerHandle::spawn(ServerConfig::minimal()).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            thread::spawn(move || match handle.call(0, new_process()).unwrap() {
                Reply::NewProcess { pid, .. } => pid,
                other => panic!("unexpected reply {:?}", other),
            })
        })
        .collect();
    let mut pids: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 4);

    handle.shutdown();
    join.join().unwrap().unwrap();
}
