//! maestro: run a declarative pipeline
//!
//! Creates the orchestration described by the `pipeline` section of the
//! configuration, starts it and logs its events until interrupted.
//!
//! ## Configuration
//! - First argument: path to a YAML configuration file (optional)
//! - MAESTRO_CONFIG: additional configuration file (optional)
//! - MAESTRO__<SECTION>__<KEY>: overrides, e.g. MAESTRO__EXECUTION__MAX_MESSAGES
//! - MAESTRO_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use maestro::config::Config;
use maestro::execution::GrpcDialer;
use maestro::storage::MemoryRepository;
use maestro::utils::bootstrap::init_tracing;
use maestro::Manager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    let pipeline = config
        .pipeline
        .clone()
        .ok_or("configuration has no pipeline section")?;

    let dialer = GrpcDialer::new(config.execution.connect_retries);
    let manager = Manager::new(Arc::new(MemoryRepository::new()), Arc::new(dialer))
        .with_config(&config);

    manager.apply_pipeline(&pipeline).await?;
    let name = pipeline.orchestration.as_str();
    manager.start_execution(name).await?;

    let mut subscription = manager.attach_execution(name).await?;
    for event in &subscription.history {
        info!(at = %event.timestamp(), "{}", event.description());
    }

    loop {
        tokio::select! {
            event = subscription.future.recv() => match event {
                Some(event) => info!(at = %event.timestamp(), "{}", event.description()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
        }
    }

    if let Err(e) = manager.detach_execution(name, subscription.token).await {
        error!(error = %e, "Detach failed");
    }
    manager.stop_execution(name).await?;

    let orchestration = manager.get_orchestration(name).await?;
    info!(orchestration = %name, phase = %orchestration.phase, "maestro finished");
    Ok(())
}
