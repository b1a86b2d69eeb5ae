use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use das_core::capability::InMemoryRegistry;
use das_core::catalog::{LocatorCatalog, RegistryInstaller};
use das_core::loggers::{LoggingOptions, setup_logging};
use das_core::{Engine, platform_status};
use tokio::signal;
use tracing::{info, warn};

mod das_logic;
use das_logic::{config, scenario};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let _guard = setup_logging(&LoggingOptions {
        level: config.log_level.clone().unwrap_or_else(|| "info".to_string()),
        log_dir: config.log_dir.clone(),
        app_name: "server_das".to_string(),
        ansi: true,
    })?;
    let engine_config = config.engine_config()?;
    info!("{}", engine_config);

    let registry = InMemoryRegistry::new();
    let installer = RegistryInstaller::new(registry.clone(), scenario::driver_factory(registry.clone()));
    let catalog = LocatorCatalog::new(Arc::new(installer));
    let (starter, status) = platform_status();

    let settle = engine_config.idle_check_delay() + Duration::from_millis(200);
    let engine = Engine::new(engine_config, Arc::new(registry.clone()), Arc::new(catalog), status);
    let follower = engine.follow(registry.subscribe());
    engine.start()?;

    match &config.scenario_path {
        Some(path) => {
            let scenario = scenario::Scenario::from_file(path)?;
            let devices = scenario.install(&registry);
            info!(devices = devices.len(), path = %path.display(), "scenario installed");
        }
        None => warn!("no scenario given, the registry starts empty"),
    }
    starter.started();

    if config.run_once.unwrap_or(false) {
        tokio::time::sleep(settle).await;
    } else {
        wait_for_shutdown().await;
    }

    let snapshot = engine.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    engine.stop();
    engine.destroy().await;
    let _ = follower.await;
    info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot listen for SIGTERM");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
