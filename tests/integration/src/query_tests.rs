//! Query Tests - the scope / query / reply / control round trip
//!
//! These tests exercise the object categories a query touches:
//! - scope operations answered through a reply object
//! - query objects run on the scope side, cancelled through their control
//! - default servants answering for unknown identities
//! - idle scope adapters shutting down and coming back

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use scopes_mw::{
    AbstractObject, Disconnector, FinishReason, Hints, InvokeInfo, MwError, QueryCtrlObject,
    QueryCtrlProxy, QueryObject, ReplyProxy, Result, ScopeObject,
};

use integration_tests::*;

#[test]
fn test_every_scope_operation_replies() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "scope-A");
    let scope = EchoScope::new("scope-A", 1);
    server.add_scope_object("scope-A", scope.clone(), Duration::ZERO).unwrap();

    let client = start(dir.path(), "client");
    let proxy = client.create_scope_proxy("scope-A").unwrap();
    let hints = Hints::new();

    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    proxy.activate("r1", &hints, &reply).unwrap();
    assert_eq!(collect_until_finished(&rx).0, vec!["scope-A:activate r1:0"]);

    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    proxy.preview("r2", &hints, &reply).unwrap();
    assert_eq!(collect_until_finished(&rx).0, vec!["scope-A:preview r2:0"]);

    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    proxy.activate_preview_action("r3", &hints, "share", &reply).unwrap();
    assert_eq!(collect_until_finished(&rx).0, vec!["scope-A:share r3:0"]);

    assert_eq!(scope.requests.load(Ordering::SeqCst), 3);
}

#[test]
fn test_query_ctrl_reaches_scope() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "scope-A");
    let scope = EchoScope::new("scope-A", 0);
    server.add_scope_object("scope-A", scope.clone(), Duration::ZERO).unwrap();

    let client = start(dir.path(), "client");
    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    let ctrl = client
        .create_scope_proxy("scope-A")
        .unwrap()
        .create_query("x", &Hints::new(), &reply)
        .unwrap();
    assert_eq!(collect_until_finished(&rx), (vec![], FinishReason::Finished));
    assert_eq!(ctrl.address().endpoint().to_string(), server.get_query_ctrl_endpoint());

    ctrl.cancel().unwrap();
    assert!(wait_until(WAIT, || scope.ctrl.cancelled.load(Ordering::SeqCst) == 1));
    ctrl.destroy().unwrap();
    assert!(wait_until(WAIT, || scope.ctrl.destroyed.load(Ordering::SeqCst) == 1));

    // The control object is gone; a oneway call to it is dropped quietly.
    ctrl.cancel().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(scope.ctrl.cancelled.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reply_finished_only_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let client = start(dir.path(), "client");
    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    assert!(reply.address().endpoint().path().starts_with(dir.path().join("pub")));

    reply.push(Bytes::from_static(b"a")).unwrap();
    reply.finished(&FinishReason::Error("boom".to_string())).unwrap();
    reply.finished(&FinishReason::Cancelled).unwrap();
    reply.push(Bytes::from_static(b"late")).unwrap();

    assert_eq!(
        collect_until_finished(&rx),
        (vec!["a".to_string()], FinishReason::Error("boom".to_string()))
    );
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_twoway_call_to_oneway_adapter_faults() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "scope-A");
    let ctrl = server.add_query_ctrl_object(Arc::new(RecordingCtrl::default())).unwrap();

    let client = start(dir.path(), "client");
    let remote = client
        .create_query_ctrl_proxy(ctrl.identity(), &server.get_query_ctrl_endpoint())
        .unwrap();
    assert!(matches!(
        remote.object().invoke_twoway("cancel", Bytes::new()),
        Err(MwError::Remote(_))
    ));
}

#[test]
fn test_default_servants() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "scope-A");
    let fallback_ctrl = Arc::new(RecordingCtrl::default());
    server.add_dflt_query_ctrl_object(fallback_ctrl.clone()).unwrap();
    let fallback_scope = EchoScope::new("fallback", 1);
    server.add_dflt_scope_object(fallback_scope.clone()).unwrap();

    let client = start(dir.path(), "client");
    let ctrl = client
        .create_query_ctrl_proxy("never-registered", &server.get_query_ctrl_endpoint())
        .unwrap();
    ctrl.cancel().unwrap();
    assert!(wait_until(WAIT, || fallback_ctrl.cancelled.load(Ordering::SeqCst) == 1));

    let scope = client
        .create_scope_proxy_at("any-scope", &server.get_scope_endpoint())
        .unwrap();
    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    scope.create_query("q", &Hints::new(), &reply).unwrap();
    assert_eq!(collect_until_finished(&rx).0, vec!["fallback:q:0"]);

    // A registered identity takes precedence over the default servant.
    let named = EchoScope::new("named", 1);
    server.add_scope_object("named", named.clone(), Duration::ZERO).unwrap();
    let scope = client.create_scope_proxy_at("named", &server.get_scope_endpoint()).unwrap();
    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    scope.create_query("q", &Hints::new(), &reply).unwrap();
    assert_eq!(collect_until_finished(&rx).0, vec!["named:q:0"]);
    assert_eq!(fallback_scope.requests.load(Ordering::SeqCst), 1);
}

#[test]
fn test_idle_scope_adapter_shuts_down() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "scope-A");
    let socket = dir.path().join("priv").join("scope-A");

    let scope = EchoScope::new("scope-A", 1);
    server
        .add_scope_object("scope-A", scope.clone(), Duration::from_millis(200))
        .unwrap();
    thread::sleep(Duration::from_millis(400));
    assert!(socket.exists(), "adapter with a servant must stay up");

    assert!(scope.disconnect());
    assert!(wait_until(WAIT, || !socket.exists()));

    // The next registration brings up a fresh adapter on the same endpoint.
    let scope = EchoScope::new("scope-A", 1);
    let proxy = server
        .add_scope_object("scope-A", scope.clone(), Duration::ZERO)
        .unwrap();
    assert!(socket.exists());

    let client = start(dir.path(), "client");
    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    let remote = client.create_scope_proxy("scope-A").unwrap();
    assert_eq!(remote.address(), proxy.address());
    remote.create_query("again", &Hints::new(), &reply).unwrap();
    assert_eq!(collect_until_finished(&rx).0, vec!["scope-A:again:0"]);
}

#[test]
fn test_stopped_client_cannot_call() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "scope-A");
    server
        .add_scope_object("scope-A", EchoScope::new("scope-A", 1), Duration::ZERO)
        .unwrap();

    let client = start(dir.path(), "client");
    let (reply, _rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    let proxy = client.create_scope_proxy("scope-A").unwrap();
    client.stop();

    match proxy.create_query("late", &Hints::new(), &reply) {
        Err(e) => assert!(e.is_lifecycle(), "{}", e),
        Ok(_) => panic!("call succeeded on a stopped middleware"),
    }
    let (again, _rx) = ChannelReply::new();
    assert!(client.add_reply_object(again).is_err());
}

/// Query that pushes one result, then waits to be cancelled
struct BlockingQuery {
    text: String,
    cancelled: Arc<AtomicBool>,
    disconnector: Mutex<Option<Disconnector>>,
}

impl AbstractObject for BlockingQuery {
    fn set_disconnect_function(&self, disconnector: Disconnector) {
        *self.disconnector.lock() = Some(disconnector);
    }
}

impl QueryObject for BlockingQuery {
    fn run(&self, reply: ReplyProxy, _info: &InvokeInfo) -> Result<()> {
        reply.push(Bytes::from(format!("first {}", self.text)))?;
        let reason = if wait_until(WAIT, || self.cancelled.load(Ordering::SeqCst)) {
            FinishReason::Cancelled
        } else {
            FinishReason::Error("never cancelled".to_string())
        };
        reply.finished(&reason)?;
        if let Some(disconnector) = self.disconnector.lock().take() {
            disconnector.disconnect();
        }
        Ok(())
    }
}

struct CancelFlag(Arc<AtomicBool>);

impl AbstractObject for CancelFlag {
    fn set_disconnect_function(&self, _disconnector: Disconnector) {}
}

impl QueryCtrlObject for CancelFlag {
    fn cancel(&self, _info: &InvokeInfo) -> Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self, _info: &InvokeInfo) -> Result<()> {
        Ok(())
    }
}

/// Scope that runs every query as a separate query object
struct QueryRunningScope;

impl AbstractObject for QueryRunningScope {
    fn set_disconnect_function(&self, _disconnector: Disconnector) {}
}

impl QueryRunningScope {
    fn unsupported() -> Result<QueryCtrlProxy> {
        Err(MwError::Remote("only queries are supported".to_string()))
    }
}

impl ScopeObject for QueryRunningScope {
    fn create_query(&self, query: &str, hints: &Hints, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        let text = match hints.get("prefix") {
            Some(prefix) => format!("{}{}", prefix, query),
            None => query.to_string(),
        };
        let cancelled = Arc::new(AtomicBool::new(false));
        let ctrl = info
            .middleware
            .add_query_ctrl_object(Arc::new(CancelFlag(cancelled.clone())))?;
        let query = info.middleware.add_query_object(Arc::new(BlockingQuery {
            text,
            cancelled,
            disconnector: Mutex::new(None),
        }))?;
        query.run(&reply)?;
        Ok(ctrl)
    }

    fn activate(&self, _: &str, _: &Hints, _: ReplyProxy, _: &InvokeInfo) -> Result<QueryCtrlProxy> {
        Self::unsupported()
    }

    fn activate_preview_action(&self, _: &str, _: &Hints, _: &str, _: ReplyProxy, _: &InvokeInfo) -> Result<QueryCtrlProxy> {
        Self::unsupported()
    }

    fn preview(&self, _: &str, _: &Hints, _: ReplyProxy, _: &InvokeInfo) -> Result<QueryCtrlProxy> {
        Self::unsupported()
    }
}

#[test]
fn test_cancel_running_query() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path(), "scope-B");
    server
        .add_scope_object("scope-B", Arc::new(QueryRunningScope), Duration::ZERO)
        .unwrap();

    let client = start(dir.path(), "client");
    let (reply, rx) = ChannelReply::new();
    let reply = client.add_reply_object(reply).unwrap();
    let scope = client.create_scope_proxy("scope-B").unwrap();

    let mut hints = Hints::new();
    hints.insert("prefix".to_string(), ">".to_string());
    let ctrl = scope.create_query("tea", &hints, &reply).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ReplyEvent::Push("first >tea".to_string()));

    ctrl.cancel().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ReplyEvent::Finished(FinishReason::Cancelled));

    match scope.preview("r", &Hints::new(), &reply) {
        Err(MwError::Remote(msg)) => assert!(msg.contains("only queries")),
        other => panic!("expected remote fault, got {:?}", other),
    }
}
