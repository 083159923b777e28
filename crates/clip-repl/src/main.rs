//! clip-repl entry point.
//!
//! Starts the kernel pool, samples the clipboard into the staging list, and
//! serves the JSON API until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clip_repl::clip::{spawn_sampler, CommandClipboard};
use clip_repl::server;
use clip_repl::state::ExecutionState;
use clip_repl::{stage_clips, AppState};
use kernel_client::{KernelConfig, PoolConfig, PreloadedPool, RemoteLauncher};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "clip-repl")]
#[command(about = "Run clipboard snippets on preloaded Jupyter kernels")]
struct Args {
    /// Address to serve the API on
    #[arg(long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Jupyter server host:port
    #[arg(long, default_value = kernel_client::DEFAULT_HOST)]
    kernel_host: String,

    /// Jupyter server token
    #[arg(long, env = "JUPYTER_TOKEN", default_value = "")]
    token: String,

    /// Connect with https/wss
    #[arg(long)]
    secure: bool,

    /// Kernelspec to start
    #[arg(long, default_value = kernel_client::DEFAULT_KERNEL_NAME)]
    kernel_name: String,

    /// Number of warm kernels to keep
    #[arg(long, default_value = "4")]
    pool_size: usize,

    /// Seconds to wait for an execution before giving up (default: wait forever)
    #[arg(long)]
    execute_timeout: Option<u64>,

    /// Clipboard polling interval in milliseconds
    #[arg(long, default_value = "100")]
    clip_interval_ms: u64,

    /// Don't watch the clipboard
    #[arg(long)]
    no_clipboard: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&args.log_level),
    )
    .init();

    let config = KernelConfig {
        kernel_name: args.kernel_name,
        secure: args.secure,
        ..KernelConfig::new(args.kernel_host)
    }
    .with_token(args.token)
    .with_execute_timeout(args.execute_timeout.map(Duration::from_secs));

    info!("Configuration:");
    info!("  Kernel server: {}", config.http_base());
    info!("  Kernel name: {}", config.kernel_name);
    info!("  Pool size: {}", args.pool_size);

    let launcher = Arc::new(RemoteLauncher::new(config));
    let pool = PreloadedPool::start(
        launcher,
        PoolConfig {
            pool_size: args.pool_size,
        },
    )
    .await;
    let app = Arc::new(AppState::new(ExecutionState::new(pool)));

    let sampler = if args.no_clipboard {
        None
    } else {
        let clipboard = CommandClipboard::detect();
        info!("[clip] Watching clipboard with {}", clipboard.program());
        let (rx, handle) = spawn_sampler(
            Arc::new(clipboard),
            Duration::from_millis(args.clip_interval_ms),
        );
        stage_clips(rx, app.clone());
        Some(handle)
    };

    let listener = tokio::net::TcpListener::bind(&args.address)
        .await
        .with_context(|| format!("Failed to bind {}", args.address))?;
    info!("Open URL: http://{}", args.address);

    server::serve(listener, app.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    })
    .await
    .context("API server failed")?;

    if let Some(sampler) = sampler {
        sampler.cancel();
    }
    app.state.close().await;
    Ok(())
}
