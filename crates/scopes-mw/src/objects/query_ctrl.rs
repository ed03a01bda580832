//! QueryCtrl category: cancellation and teardown notifications for a running query

use std::sync::{Arc, Weak};

use bytes::Bytes;

use super::{AbstractObject, InvokeInfo};
use crate::adapter::Servant;
use crate::middleware::Middleware;
use crate::types::{Category, Result};

const CANCEL: &str = "cancel";
const DESTROY: &str = "destroy";

/// Control side of a running query
///
/// Cancellation is a notification: the query's handler is expected to
/// notice it and return, nothing interrupts it.
pub trait QueryCtrlObject: AbstractObject {
    fn cancel(&self, info: &InvokeInfo) -> Result<()>;
    fn destroy(&self, info: &InvokeInfo) -> Result<()>;
}

pub(crate) fn query_ctrl_servant(ctrl: Arc<dyn QueryCtrlObject>, mw: Weak<Middleware>) -> Arc<Servant> {
    let cancel_ctrl = ctrl.clone();
    let cancel_mw = mw.clone();
    Servant::builder(Category::QueryCtrl)
        .operation(CANCEL, move |current, _| {
            cancel_ctrl.cancel(&InvokeInfo::new(current, &cancel_mw)?)?;
            Ok(Bytes::new())
        })
        .operation(DESTROY, move |current, _| {
            ctrl.destroy(&InvokeInfo::new(current, &mw)?)?;
            Ok(Bytes::new())
        })
        .build()
}

typed_proxy! {
    /// Oneway proxy to a query control servant
    QueryCtrlProxy
}

impl QueryCtrlProxy {
    pub fn cancel(&self) -> Result<()> {
        self.proxy.invoke_oneway(CANCEL, Bytes::new())
    }

    pub fn destroy(&self) -> Result<()> {
        self.proxy.invoke_oneway(DESTROY, Bytes::new())
    }
}
