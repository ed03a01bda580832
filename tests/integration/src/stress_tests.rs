//! Stress Tests - many concurrent callers against few adapter threads

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use scopes_mw::{FinishReason, Hints, MiddlewareState};

use integration_tests::*;

const CLIENTS: usize = 8;
const CALLS_PER_CLIENT: usize = 50;

#[test]
fn test_concurrent_registry_calls() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let _host = RegistryHost::start(dir.path(), &["a", "b", "c"]);

    let start_time = Instant::now();
    let handles: Vec<_> = (0..CLIENTS)
        .map(|i| {
            let base = dir.path().to_path_buf();
            thread::spawn(move || {
                let client = start(&base, &format!("client-{}", i));
                let registry = client.registry_proxy().unwrap().unwrap();
                for n in 0..CALLS_PER_CLIENT {
                    assert_eq!(registry.list().unwrap().len(), 3);
                    let id = ["a", "b", "c"][n % 3];
                    assert_eq!(registry.get_metadata(id).unwrap().scope_id, id);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    tracing::info!(
        "{} registry calls in {:?}",
        CLIENTS * CALLS_PER_CLIENT * 2,
        start_time.elapsed()
    );
}

#[test]
fn test_concurrent_queries_on_one_scope() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "scope-A");
    let scope = EchoScope::new("scope-A", 3);
    server.add_scope_object("scope-A", scope.clone(), Duration::ZERO).unwrap();

    let queries_per_client = 10;
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let base = dir.path().to_path_buf();
            thread::spawn(move || {
                let client = start(&base, &format!("client-{}", i));
                let proxy = client.create_scope_proxy("scope-A").unwrap();
                for n in 0..queries_per_client {
                    let (reply, rx) = ChannelReply::new();
                    let reply = client.add_reply_object(reply).unwrap();
                    let text = format!("{}-{}", i, n);
                    proxy.create_query(&text, &Hints::new(), &reply).unwrap();
                    let (pushed, reason) = collect_until_finished(&rx);
                    assert_eq!(reason, FinishReason::Finished);
                    assert_eq!(pushed.len(), 3);
                    assert!(pushed.iter().all(|p| p.contains(&text)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(scope.requests.load(Ordering::SeqCst), 4 * queries_per_client);
}

#[test]
fn test_oneway_flood_keeps_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mw = start(dir.path(), "receiver");
    let (reply, rx) = ChannelReply::new();
    let reply = mw.add_reply_object(reply).unwrap();

    let count = 500;
    for i in 0..count {
        reply.push(Bytes::from(i.to_string())).unwrap();
    }
    reply.finished(&FinishReason::Finished).unwrap();

    let (pushed, reason) = collect_until_finished(&rx);
    assert_eq!(reason, FinishReason::Finished);
    let expected: Vec<String> = (0..count).map(|i| i.to_string()).collect();
    assert_eq!(pushed, expected);
}

#[test]
fn test_start_stop_cycles() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mw = start(dir.path(), "cycler");
    let socket = dir.path().join("priv").join("cycler-c");

    for _ in 0..20 {
        let ctrl = Arc::new(RecordingCtrl::default());
        let proxy = mw.add_query_ctrl_object(ctrl.clone()).unwrap();
        assert!(socket.exists());
        proxy.cancel().unwrap();
        assert!(wait_until(WAIT, || ctrl.cancelled.load(Ordering::SeqCst) == 1));

        mw.stop();
        assert_eq!(mw.state(), MiddlewareState::Stopped);
        assert!(!socket.exists());
        mw.start().unwrap();
    }
}
