//! Query category

use std::sync::{Arc, Weak};

use bytes::Bytes;
use scopes_wire::PayloadReader;

use super::{proxy_payload, read_proxy, AbstractObject, InvokeInfo, ReplyProxy};
use crate::adapter::Servant;
use crate::invoke::ObjectProxy;
use crate::middleware::Middleware;
use crate::types::{Category, Result};

const RUN: &str = "run";

/// A query that pushes its results to a reply proxy
pub trait QueryObject: AbstractObject {
    fn run(&self, reply: ReplyProxy, info: &InvokeInfo) -> Result<()>;
}

pub(crate) fn query_servant(query: Arc<dyn QueryObject>, mw: Weak<Middleware>) -> Arc<Servant> {
    Servant::builder(Category::Query)
        .operation(RUN, move |current, payload| {
            let mut reader = PayloadReader::new(payload);
            let reply = read_proxy(&mut reader, "reply")?;
            reader.finish()?;
            let info = InvokeInfo::new(current, &mw)?;
            query.run(ReplyProxy::new(ObjectProxy::new(mw.clone(), reply)), &info)?;
            Ok(Bytes::new())
        })
        .build()
}

typed_proxy! {
    /// Oneway proxy to a query servant
    QueryProxy
}

impl QueryProxy {
    pub fn run(&self, reply: &ReplyProxy) -> Result<()> {
        self.proxy.invoke_oneway(RUN, proxy_payload(reply.address()))
    }
}
