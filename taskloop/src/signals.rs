//! Ctrl+C handling.
//!
//! The first interrupt fires the cancellation token so the engine can stop
//! at a safe point. A second interrupt exits at once.

use std::thread;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::exit_codes;

/// Install the interrupt handler on a dedicated thread.
pub fn install(cancel: CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("taskloop-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("could not listen for Ctrl+C");
                    return;
                }
                info!("interrupt received; stopping after the current step");
                eprintln!("\nInterrupted: finishing up. Press Ctrl+C again to exit immediately.");
                cancel.cancel();

                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("second interrupt; exiting");
                    std::process::exit(exit_codes::CANCELLED);
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}
