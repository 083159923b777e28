//! Client for Jupyter server kernels.
//!
//! A [`KernelSession`] creates one kernel through the server's REST API and
//! drives it over the multiplexed channels WebSocket, with any number of
//! execute requests in flight at once. A [`PreloadedPool`] keeps a set of
//! sessions warm, each one already initialized with a shared preamble.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kernel_client::{KernelConfig, PoolConfig, PreloadedPool, RemoteLauncher};
//!
//! # async fn run() -> kernel_client::Result<()> {
//! let launcher = RemoteLauncher::new(KernelConfig::new("127.0.0.1:8888"));
//! let pool = PreloadedPool::start(Arc::new(launcher), PoolConfig::default()).await;
//!
//! let session = pool.get().await?;
//! let output = session.execute_code("1 + 1").await?;
//! println!("{:?}", output.results);
//! session.close().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod launcher;
mod message;
mod pool;
mod rest;
mod session;
mod traceback;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::{KernelConfig, DEFAULT_HOST, DEFAULT_KERNEL_NAME};
pub use error::{KernelError, Result};
pub use launcher::{KernelLauncher, RemoteLauncher};
pub use message::{
    ExceptionRecord, ExecuteEnvelope, KernelMessage, MessageKind, ResultRecord, StreamFragment,
};
pub use pool::{PoolConfig, PoolStatus, PreloadedPool};
pub use rest::KernelsApi;
pub use session::{ExecutionOutput, FrameSink, FrameStream, KernelSession};
pub use traceback::{escape_html, render_traceback};
