//! Registry Tests - scope lookup across middleware instances
//!
//! A registry middleware serves a `LocalRegistry`; clients reach it through
//! the registry proxy of their own middleware. Scope processes are started
//! by an in-process launcher when a client locates them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use scopes_mw::{Hints, LocalRegistry, MwError, ProcessState, ScopeMetadata, TypedProxy};

use integration_tests::*;

#[test]
fn test_list_find_and_metadata() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = RegistryHost::start(dir.path(), &["news", "weather"]);
    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();

    let all = registry.list().unwrap();
    assert_eq!(all.keys().collect::<Vec<_>>(), vec!["news", "weather"]);
    assert_eq!(all["news"].author, "integration");

    let meta = registry.get_metadata("weather").unwrap();
    assert_eq!(meta.display_name, "weather scope");
    assert_eq!(meta.proxy.endpoint().path(), dir.path().join("priv").join("weather"));

    // find hands out the proxy without starting the scope
    let news = registry.find("news").unwrap();
    assert_eq!(news.identity(), "news");
    assert_eq!(host.launcher.launched.load(Ordering::SeqCst), 0);
    assert_eq!(host.registry.process_state("news"), Some(ProcessState::Stopped));
}

#[test]
fn test_unknown_scope_is_not_found() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let _host = RegistryHost::start(dir.path(), &["news"]);
    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();

    assert!(matches!(registry.get_metadata("nope"), Err(MwError::NotFound(_))));
    assert!(matches!(registry.find("nope"), Err(MwError::NotFound(_))));
    assert!(matches!(registry.locate("nope"), Err(MwError::NotFound(_))));

    // Invalid arguments are faults, not lookups that came up empty
    match registry.find("") {
        Err(MwError::Remote(msg)) => assert!(msg.contains("empty name"), "{}", msg),
        other => panic!("expected remote fault, got {:?}", other),
    }
}

#[test]
fn test_no_registry_running() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();
    assert!(matches!(registry.list(), Err(MwError::ObjectNotExist { .. })));
}

#[test]
fn test_locate_starts_scope_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = RegistryHost::start(dir.path(), &["news"]);
    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();

    let scope = registry.locate("news").unwrap();
    assert_eq!(host.launcher.launched.load(Ordering::SeqCst), 1);
    assert_eq!(host.registry.process_state("news"), Some(ProcessState::Running));

    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    scope.create_query("rust", &Hints::new(), &reply).unwrap();
    let (pushed, reason) = collect_until_finished(&rx);
    assert_eq!(pushed, vec!["news:rust:0", "news:rust:1"]);
    assert_eq!(reason, scopes_mw::FinishReason::Finished);

    registry.locate("news").unwrap();
    assert_eq!(host.launcher.launched.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_locates_launch_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = RegistryHost::start(dir.path(), &["weather"]);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let base = dir.path().to_path_buf();
            thread::spawn(move || {
                let client = start(&base, &format!("client-{}", i));
                let registry = client.registry_proxy().unwrap().unwrap();
                registry.locate("weather").map(|proxy| proxy.identity().to_string())
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), "weather");
    }
    assert_eq!(host.launcher.launched.load(Ordering::SeqCst), 1);
}

#[test]
fn test_locate_gives_up_on_silent_scope() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = RegistryHost::start(dir.path(), &["mute"]);
    host.launcher.keep_silent("mute");
    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();

    match registry.locate("mute") {
        Err(MwError::Remote(msg)) => assert!(msg.contains("too long"), "{}", msg),
        other => panic!("expected start timeout, got {:?}", other),
    }
    assert_eq!(host.launcher.killed.load(Ordering::SeqCst), 1);
    assert!(!host.launcher.is_running("mute"));
    assert_eq!(host.registry.process_state("mute"), Some(ProcessState::Stopped));
}

#[test]
fn test_relocate_after_scope_exit() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = RegistryHost::start(dir.path(), &["news"]);
    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();

    registry.locate("news").unwrap();
    host.launcher.stop_scope("news");
    assert_eq!(host.registry.process_state("news"), Some(ProcessState::Stopped));

    registry.locate("news").unwrap();
    assert_eq!(host.launcher.launched.load(Ordering::SeqCst), 2);
    assert!(host.launcher.is_running("news"));
}

#[test]
fn test_scope_state_callback() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = RegistryHost::start(dir.path(), &["news"]);
    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();

    let (tx, rx) = mpsc::channel();
    let subscriber = registry
        .set_scope_state_callback("news", move |running| {
            let _ = tx.send(running);
        })
        .unwrap();
    assert!(subscriber.wait_until_connected(WAIT));

    registry.locate("news").unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap());

    host.launcher.stop_scope("news");
    assert!(!rx.recv_timeout(WAIT).unwrap());

    assert!(registry.set_scope_state_callback("", |_| {}).is_err());
    assert!(registry.set_scope_state_callback("a/b", |_| {}).is_err());
    assert!(registry.set_scope_state_callback("a:b", |_| {}).is_err());
}

#[test]
fn test_list_update_callback() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = RegistryHost::start(dir.path(), &["news"]);
    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let subscriber = registry
        .set_list_update_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(subscriber.wait_until_connected(WAIT));

    let proxy = host.mw.create_scope_proxy("sports").unwrap();
    host.registry
        .add_local_scope(ScopeMetadata::new("sports", proxy.address().clone()))
        .unwrap();
    assert!(wait_until(WAIT, || updates.load(Ordering::SeqCst) == 1));
    assert!(registry.list().unwrap().contains_key("sports"));

    assert!(host.registry.remove_local_scope("sports").unwrap());
    assert!(wait_until(WAIT, || updates.load(Ordering::SeqCst) == 2));
    assert!(!registry.list().unwrap().contains_key("sports"));
}

#[test]
fn test_remote_registry_fallback() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let host = RegistryHost::start(dir.path(), &["news"]);

    let remote_mw = start(dir.path(), "SSRegistry");
    let remote = Arc::new(LocalRegistry::new(InProcessLauncher::new(dir.path()), REGISTRY_LOCATE_TIMEOUT));
    let remote_scope = remote_mw.create_scope_proxy("remote-scope").unwrap();
    remote
        .add_local_scope(ScopeMetadata::new("remote-scope", remote_scope.address().clone()).with_display_name("far away"))
        .unwrap();
    let remote_proxy = remote_mw.add_registry_object("SSRegistry", remote.clone()).unwrap();

    // The host talks to the remote registry through its own middleware.
    match host.mw.string_to_proxy(&remote_proxy.to_string()).unwrap() {
        Some(TypedProxy::Registry(proxy)) => host.registry.set_remote_registry(proxy),
        other => panic!("expected registry proxy, got {:?}", other),
    }

    let client = start(dir.path(), "client");
    let registry = client.registry_proxy().unwrap().unwrap();
    let all = registry.list().unwrap();
    assert!(all.contains_key("news"));
    assert!(all.contains_key("remote-scope"));
    assert_eq!(registry.get_metadata("remote-scope").unwrap().display_name, "far away");
    assert_eq!(registry.find("remote-scope").unwrap().identity(), "remote-scope");
    assert!(matches!(registry.get_metadata("nowhere"), Err(MwError::NotFound(_))));

    // Only local scopes can be started
    assert!(matches!(registry.locate("remote-scope"), Err(MwError::NotFound(_))));

    remote.disconnect();
    remote_mw.stop();
}
