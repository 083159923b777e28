//! Pool of warm kernel sessions that all share one preamble.
//!
//! Every session in the pool has already executed the pool's current preamble,
//! so callers get a kernel whose namespace matches the committed history
//! without waiting for it to replay. Changing the preamble (`reset`) discards
//! the warm sessions and builds a fresh set in the background.
//!
//! Builds are tagged with the generation they were started under. A build
//! that completes after a newer reset closes its session instead of handing
//! it out, so a session initialized with a superseded preamble is never
//! returned from [`PreloadedPool::get`].

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{KernelError, Result};
use crate::launcher::KernelLauncher;
use crate::session::KernelSession;

/// Configuration for the kernel pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of warm sessions to maintain.
    pub pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

/// Current status of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Sessions ready to hand out.
    pub available: usize,
    /// Sessions being built for the current generation.
    pub building: usize,
    /// Target pool size.
    pub target: usize,
    /// Bumped on every reset.
    pub generation: u64,
}

struct PoolInner {
    preamble: String,
    generation: u64,
    kernels: Vec<Arc<KernelSession>>,
    building: usize,
    closed: bool,
}

impl PoolInner {
    fn deficit(&self, target: usize) -> usize {
        target.saturating_sub(self.kernels.len() + self.building)
    }
}

struct PoolShared {
    launcher: Arc<dyn KernelLauncher>,
    target: usize,
    inner: Mutex<PoolInner>,
}

struct RebuildCommand {
    preamble: String,
    done: oneshot::Sender<()>,
}

/// A pool of preloaded kernel sessions.
pub struct PreloadedPool {
    shared: Arc<PoolShared>,
    rebuild_tx: mpsc::UnboundedSender<RebuildCommand>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl PreloadedPool {
    /// Create an empty pool with preamble `""`. Nothing is built until the
    /// first `reset` or `get`.
    pub fn new(launcher: Arc<dyn KernelLauncher>, config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            launcher,
            target: config.pool_size,
            inner: Mutex::new(PoolInner {
                preamble: String::new(),
                generation: 0,
                kernels: Vec::with_capacity(config.pool_size),
                building: 0,
                closed: false,
            }),
        });

        let (rebuild_tx, mut rebuild_rx) = mpsc::unbounded_channel::<RebuildCommand>();
        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            while let Some(command) = rebuild_rx.recv().await {
                reset_pool(&worker_shared, &command.preamble).await;
                let _ = command.done.send(());
            }
            debug!("[pool] Rebuild worker finished");
        });

        Self {
            shared,
            rebuild_tx,
            worker: StdMutex::new(Some(worker)),
        }
    }

    /// Create a pool and start filling it with blank sessions.
    pub async fn start(launcher: Arc<dyn KernelLauncher>, config: PoolConfig) -> Self {
        let pool = Self::new(launcher, config);
        pool.reset("").await;
        pool
    }

    /// Take a warm session, or build one on the spot if none is ready.
    ///
    /// The returned session is owned by the caller and has run the preamble
    /// that was current when `get` returned.
    pub async fn get(&self) -> Result<Arc<KernelSession>> {
        loop {
            let (preamble, generation) = {
                let mut inner = self.shared.inner.lock().await;
                if inner.closed {
                    return Err(KernelError::Transport("kernel pool is closed".into()));
                }

                if let Some(session) = inner.kernels.pop() {
                    info!(
                        "[pool] Pool HIT - took kernel {} (remaining: {})",
                        session.id(),
                        inner.kernels.len()
                    );
                    if !inner.kernels.is_empty() && inner.deficit(self.shared.target) > 0 {
                        inner.building += 1;
                        spawn_builder(
                            self.shared.clone(),
                            inner.preamble.clone(),
                            inner.generation,
                        );
                    }
                    return Ok(session);
                }

                info!(
                    "[pool] Pool MISS - no kernel available (building: {}, target: {})",
                    inner.building, self.shared.target
                );
                (inner.preamble.clone(), inner.generation)
            };

            let session = build_session(self.shared.launcher.as_ref(), &preamble).await?;

            if self.shared.inner.lock().await.generation == generation {
                return Ok(session);
            }
            debug!(
                "[pool] Preamble changed while building kernel {}, retrying",
                session.id()
            );
            session.close().await;
        }
    }

    /// Replace the preamble and rebuild every warm session.
    ///
    /// Returns once the old sessions are detached and the new builds are
    /// started; the builds themselves complete in the background.
    pub async fn reset(&self, preamble: &str) {
        reset_pool(&self.shared, preamble).await;
    }

    /// Queue a reset behind any rebuilds already requested.
    ///
    /// Resets requested this way are applied one at a time in the order they
    /// were requested. The receiver fires once this one has been applied.
    pub fn request_rebuild(&self, preamble: impl Into<String>) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let command = RebuildCommand {
            preamble: preamble.into(),
            done,
        };
        if self.rebuild_tx.send(command).is_err() {
            warn!("[pool] Rebuild requested after the pool was closed");
        }
        rx
    }

    /// Close every held session and stop the rebuild worker.
    pub async fn close(&self) {
        let drained = {
            let mut inner = self.shared.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.generation += 1;
            inner.building = 0;
            std::mem::take(&mut inner.kernels)
        };

        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }

        info!("[pool] Closing {} pooled kernel(s)", drained.len());
        for session in drained {
            session.close().await;
        }
    }

    pub async fn status(&self) -> PoolStatus {
        let inner = self.shared.inner.lock().await;
        PoolStatus {
            available: inner.kernels.len(),
            building: inner.building,
            target: self.shared.target,
            generation: inner.generation,
        }
    }

    /// The preamble new sessions are initialized with.
    pub async fn preamble(&self) -> String {
        self.shared.inner.lock().await.preamble.clone()
    }
}

impl Drop for PreloadedPool {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
    }
}

async fn reset_pool(shared: &Arc<PoolShared>, preamble: &str) {
    let (drained, generation) = {
        let mut inner = shared.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.preamble = preamble.to_string();
        inner.generation += 1;
        inner.building = shared.target;
        (std::mem::take(&mut inner.kernels), inner.generation)
    };

    info!(
        "[pool] Reset to generation {} ({} line preamble), rebuilding {} kernel(s)",
        generation,
        preamble.lines().count(),
        shared.target
    );

    if !drained.is_empty() {
        tokio::spawn(async move {
            for session in drained {
                session.close().await;
            }
        });
    }

    for _ in 0..shared.target {
        spawn_builder(shared.clone(), preamble.to_string(), generation);
    }
}

/// Launch a session and run the preamble on it.
async fn build_session(launcher: &dyn KernelLauncher, preamble: &str) -> Result<Arc<KernelSession>> {
    let session = launcher.launch().await?;

    match session.execute_code(preamble).await {
        Ok(output) => {
            if !output.exceptions.is_empty() {
                warn!(
                    "[pool] Preamble raised {} exception(s) on kernel {}",
                    output.exceptions.len(),
                    session.id()
                );
            }
            session.mark_initialized(preamble);
            Ok(session)
        }
        Err(e) => {
            session.close().await;
            Err(e)
        }
    }
}

fn spawn_builder(shared: Arc<PoolShared>, preamble: String, generation: u64) {
    tokio::spawn(async move {
        let built = build_session(shared.launcher.as_ref(), &preamble).await;

        let mut inner = shared.inner.lock().await;
        let current = inner.generation == generation;
        if current {
            inner.building = inner.building.saturating_sub(1);
        }

        match built {
            Ok(session) if current => {
                debug!(
                    "[pool] Kernel {} ready (available: {})",
                    session.id(),
                    inner.kernels.len() + 1
                );
                inner.kernels.push(session);
            }
            Ok(session) => {
                drop(inner);
                debug!(
                    "[pool] Discarding kernel {} built for generation {}",
                    session.id(),
                    generation
                );
                session.close().await;
            }
            Err(e) => {
                error!("[pool] Failed to build kernel: {}", e);
            }
        }
    });
}
