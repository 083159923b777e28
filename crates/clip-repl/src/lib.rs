//! Run clipboard snippets against a pool of preloaded Jupyter kernels.
//!
//! Copied code lands in a staging list. Executing a snippet runs it on a
//! fresh kernel that has already replayed every committed snippet, so
//! several candidates can be tried side by side before one is selected and
//! becomes part of the history.

use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod clip;
pub mod server;
pub mod staging;
pub mod state;

pub use server::AppState;

/// Stage every clipboard text received on `rx` until the sampler stops.
pub fn stage_clips(mut rx: mpsc::Receiver<String>, app: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            let id = app.staging.add(text);
            debug!("[clip] Staged snippet #{}", id);
        }
    })
}
