//! RPC and action proxies.
//!
//! Device-reported errors come back as a failed [`RpcOutcome`], matching what
//! the owner's local RPC service returns. Only clustering failures surface as
//! `Err`.

use super::ProxySet;
use crate::channel::wire::{Reply, Request};
use crate::device::{DataPath, RpcOutcome};
use crate::error::MountError;
use serde_json::Value;

fn outcome(proxies: &ProxySet, reply: Reply) -> Result<RpcOutcome, MountError> {
    match reply {
        Reply::Success(output) => Ok(RpcOutcome::success(Some(output))),
        Reply::Empty => Ok(RpcOutcome::success(None)),
        Reply::Error(errors) => Ok(RpcOutcome::failed(errors)),
        Reply::Fault(fault) => Err(proxies.fault_error(fault)),
    }
}

#[derive(Clone)]
pub struct ProxyRpcService {
    proxies: ProxySet,
}

impl ProxyRpcService {
    pub(crate) fn new(proxies: ProxySet) -> Self {
        Self { proxies }
    }

    pub async fn invoke(&self, name: &str, input: Option<Value>) -> Result<RpcOutcome, MountError> {
        let reply = self
            .proxies
            .ask(Request::InvokeRpc {
                name: name.to_string(),
                input,
            })
            .await?;
        outcome(&self.proxies, reply)
    }
}

#[derive(Clone)]
pub struct ProxyActionService {
    proxies: ProxySet,
}

impl ProxyActionService {
    pub(crate) fn new(proxies: ProxySet) -> Self {
        Self { proxies }
    }

    pub async fn invoke(
        &self,
        path: &DataPath,
        name: &str,
        input: Option<Value>,
    ) -> Result<RpcOutcome, MountError> {
        let reply = self
            .proxies
            .ask(Request::InvokeAction {
                path: path.clone(),
                name: name.to_string(),
                input,
            })
            .await?;
        outcome(&self.proxies, reply)
    }
}
