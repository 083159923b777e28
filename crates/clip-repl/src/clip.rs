//! Clipboard sampling.
//!
//! The sampler polls a [`ClipboardSource`] at a fixed interval and forwards
//! text whenever it changes. Read failures are skipped silently so that an
//! empty or non-text clipboard does not stop the stream.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Clipboard does not hold UTF-8 text")]
    NotText,
}

/// Something that can report the current clipboard text.
pub trait ClipboardSource: Send + Sync + 'static {
    fn read(&self) -> BoxFuture<'_, Result<String, ClipError>>;
}

/// Reads the clipboard by running the platform's paste command.
#[derive(Debug, Clone)]
pub struct CommandClipboard {
    program: String,
    args: Vec<String>,
}

impl CommandClipboard {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// The paste command for the current platform.
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Self::new("pbpaste", &[])
        } else if cfg!(windows) {
            Self::new("powershell", &["-NoProfile", "-Command", "Get-Clipboard"])
        } else if std::env::var_os("WAYLAND_DISPLAY").is_some() {
            Self::new("wl-paste", &["--no-newline"])
        } else {
            Self::new("xclip", &["-selection", "clipboard", "-o"])
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ClipboardSource for CommandClipboard {
    fn read(&self) -> BoxFuture<'_, Result<String, ClipError>> {
        Box::pin(async move {
            let output = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|source| ClipError::Spawn {
                    program: self.program.clone(),
                    source,
                })?;

            if !output.status.success() {
                return Err(ClipError::Command {
                    program: self.program.clone(),
                    status: output.status,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }

            String::from_utf8(output.stdout).map_err(|_| ClipError::NotText)
        })
    }
}

/// Stops the sampler when cancelled or dropped.
pub struct SamplerHandle {
    task: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll `source` every `interval` and send each new non-empty clipboard text.
///
/// The first non-empty text seen is sent too. The sampler stops when the
/// handle is cancelled or the receiver is dropped.
pub fn spawn_sampler(
    source: Arc<dyn ClipboardSource>,
    interval: Duration,
) -> (mpsc::Receiver<String>, SamplerHandle) {
    let (tx, rx) = mpsc::channel(16);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut previous = String::new();

        loop {
            ticker.tick().await;

            let text = match source.read().await {
                Ok(text) => text,
                Err(e) => {
                    debug!("[clip] Skipping clipboard read: {}", e);
                    continue;
                }
            };
            if text.trim().is_empty() || text == previous {
                continue;
            }

            if tx.send(text.clone()).await.is_err() {
                break;
            }
            previous = text;
        }
        info!("[clip] Sampler stopped");
    });

    (rx, SamplerHandle { task })
}
