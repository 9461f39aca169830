//! Service entry point for the inference governor.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`GovernorConfig`] from disk (defaults on first run).
//! 3. Create the [`tokio`] runtime.
//! 4. Build the fast/deep [`OllamaBackend`]s and the process manager.
//! 5. Wire the [`Governor`] and start its background loops.
//! 6. Wait for Ctrl-C, then cancel in-flight work and stop the loops.

use std::sync::Arc;

use anyhow::Context;
use inference_governor::{
    admission::SysinfoMetricsSource,
    backend::OllamaBackend,
    config::{AppPaths, GovernorConfig},
    governor::Governor,
    supervisor::SysinfoProcessManager,
};

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("inference governor starting up");

    // 2. Configuration
    let config = GovernorConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        GovernorConfig::default()
    });
    log::info!(
        "config: {} (pid file {})",
        AppPaths::new().settings_file.display(),
        config.supervisor.pid_file_path().display()
    );

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(run(config))
}

async fn run(config: GovernorConfig) -> anyhow::Result<()> {
    // 4. Backends and process control
    let fast = Arc::new(OllamaBackend::from_config("fast", &config.backends.fast));
    let deep = Arc::new(OllamaBackend::from_config("deep", &config.backends.deep));
    log::info!(
        "backends: fast={} @ {}, deep={} @ {}",
        fast.model(),
        config.backends.fast.base_url,
        deep.model(),
        config.backends.deep.base_url
    );

    // 5. Governor + background loops
    let governor = Arc::new(Governor::new(
        config,
        fast,
        deep.clone(),
        deep,
        Arc::new(SysinfoProcessManager::new()),
    ));
    let loops = governor.spawn_background(Box::new(SysinfoMetricsSource::new()));
    log::info!("governor ready, intake {:?}", governor.gate_state().mode);

    // 6. Shutdown
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    governor.shutdown();
    for handle in loops {
        if let Err(e) = handle.await {
            log::warn!("background loop ended abnormally: {e}");
        }
    }
    log::info!("inference governor stopped");
    Ok(())
}
