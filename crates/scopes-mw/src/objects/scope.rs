//! Scope category
//!
//! Every scope operation spawns a query and answers with the control proxy
//! of that query. Results are passed as opaque strings; their format
//! belongs to the application.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use scopes_wire::{PayloadReader, PayloadWriter};

use super::{proxy_payload, read_proxy, returned_proxy, AbstractObject, InvokeInfo};
use super::{QueryCtrlProxy, ReplyProxy};
use crate::adapter::Servant;
use crate::invoke::ObjectProxy;
use crate::middleware::Middleware;
use crate::types::{Category, Hints, Result};

const CREATE_QUERY: &str = "create_query";
const ACTIVATE: &str = "activate";
const ACTIVATE_PREVIEW_ACTION: &str = "activate_preview_action";
const PREVIEW: &str = "preview";

/// A scope as seen by the middleware
pub trait ScopeObject: AbstractObject {
    fn create_query(
        &self,
        query: &str,
        hints: &Hints,
        reply: ReplyProxy,
        info: &InvokeInfo,
    ) -> Result<QueryCtrlProxy>;

    fn activate(
        &self,
        result: &str,
        hints: &Hints,
        reply: ReplyProxy,
        info: &InvokeInfo,
    ) -> Result<QueryCtrlProxy>;

    fn activate_preview_action(
        &self,
        result: &str,
        hints: &Hints,
        action_id: &str,
        reply: ReplyProxy,
        info: &InvokeInfo,
    ) -> Result<QueryCtrlProxy>;

    fn preview(
        &self,
        result: &str,
        hints: &Hints,
        reply: ReplyProxy,
        info: &InvokeInfo,
    ) -> Result<QueryCtrlProxy>;
}

/// Arguments shared by all scope operations
struct ScopeRequest {
    subject: String,
    hints: Hints,
    action_id: Option<String>,
    reply: ReplyProxy,
}

impl ScopeRequest {
    fn read(payload: Bytes, with_action: bool, mw: &Weak<Middleware>) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let subject: String = reader.get()?;
        let hints: Hints = reader.get()?;
        let action_id = if with_action {
            Some(reader.get::<String>()?)
        } else {
            None
        };
        let reply = read_proxy(&mut reader, "reply")?;
        reader.finish()?;
        Ok(Self {
            subject,
            hints,
            action_id,
            reply: ReplyProxy::new(ObjectProxy::new(mw.clone(), reply)),
        })
    }
}

pub(crate) fn scope_servant(scope: Arc<dyn ScopeObject>, mw: Weak<Middleware>) -> Arc<Servant> {
    let mut builder = Servant::builder(Category::Scope);
    for operation in [CREATE_QUERY, ACTIVATE, ACTIVATE_PREVIEW_ACTION, PREVIEW] {
        let scope = scope.clone();
        let mw = mw.clone();
        builder = builder.operation(operation, move |current, payload| {
            let request = ScopeRequest::read(payload, operation == ACTIVATE_PREVIEW_ACTION, &mw)?;
            let info = InvokeInfo::new(current, &mw)?;
            let ctrl = match operation {
                CREATE_QUERY => scope.create_query(&request.subject, &request.hints, request.reply, &info)?,
                ACTIVATE => scope.activate(&request.subject, &request.hints, request.reply, &info)?,
                PREVIEW => scope.preview(&request.subject, &request.hints, request.reply, &info)?,
                _ => scope.activate_preview_action(
                    &request.subject,
                    &request.hints,
                    request.action_id.as_deref().unwrap_or_default(),
                    request.reply,
                    &info,
                )?,
            };
            Ok(proxy_payload(ctrl.address()))
        });
    }
    builder.build()
}

typed_proxy! {
    /// Twoway proxy to a scope servant
    ScopeProxy
}

impl ScopeProxy {
    pub fn create_query(&self, query: &str, hints: &Hints, reply: &ReplyProxy) -> Result<QueryCtrlProxy> {
        self.call(CREATE_QUERY, PayloadWriter::new().put(query).put(hints), reply)
    }

    pub fn activate(&self, result: &str, hints: &Hints, reply: &ReplyProxy) -> Result<QueryCtrlProxy> {
        self.call(ACTIVATE, PayloadWriter::new().put(result).put(hints), reply)
    }

    pub fn activate_preview_action(
        &self,
        result: &str,
        hints: &Hints,
        action_id: &str,
        reply: &ReplyProxy,
    ) -> Result<QueryCtrlProxy> {
        self.call(
            ACTIVATE_PREVIEW_ACTION,
            PayloadWriter::new().put(result).put(hints).put(action_id),
            reply,
        )
    }

    pub fn preview(&self, result: &str, hints: &Hints, reply: &ReplyProxy) -> Result<QueryCtrlProxy> {
        self.call(PREVIEW, PayloadWriter::new().put(result).put(hints), reply)
    }

    fn call(&self, operation: &str, args: PayloadWriter, reply: &ReplyProxy) -> Result<QueryCtrlProxy> {
        let payload = args.put(&reply.address().to_string()).finish();
        let response = self.proxy.invoke_twoway(operation, payload)?;
        Ok(QueryCtrlProxy::new(returned_proxy(&self.proxy, response, "query control")?))
    }
}
