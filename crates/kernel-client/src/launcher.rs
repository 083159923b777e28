//! Where pooled sessions come from.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::KernelConfig;
use crate::error::Result;
use crate::rest::KernelsApi;
use crate::session::KernelSession;

/// Produces fresh, connected kernel sessions.
pub trait KernelLauncher: Send + Sync + 'static {
    fn launch(&self) -> BoxFuture<'_, Result<Arc<KernelSession>>>;
}

/// Launches kernels on a Jupyter server.
#[derive(Clone)]
pub struct RemoteLauncher {
    api: KernelsApi,
}

impl RemoteLauncher {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            api: KernelsApi::new(config),
        }
    }

    pub fn api(&self) -> &KernelsApi {
        &self.api
    }
}

impl KernelLauncher for RemoteLauncher {
    fn launch(&self) -> BoxFuture<'_, Result<Arc<KernelSession>>> {
        Box::pin(KernelSession::create(&self.api))
    }
}
