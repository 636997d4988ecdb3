use anyhow::Result;
use tracing::{Instrument, error, info, info_span};

use host_upgrades::config::Config;
use host_upgrades::health::{self, HealthState};
use host_upgrades::{logging, upgrader};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args();
    logging::init(&config.log_format, &config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT"),
        build_date = env!("BUILD_DATE"),
        "Host upgrades starting"
    );

    let health_state = HealthState::new();
    if config.health_port != 0 {
        let port = config.health_port;
        let state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, state).await {
                error!(error = %e, "Health server failed");
            }
        });
    }

    let span = info_span!("host_upgrades", node = config.kube_node.as_deref().unwrap_or(""));
    let run = upgrader::run(config, health_state).instrument(span);

    tokio::select! {
        result = run => {
            match result {
                Ok(()) => info!("Host upgrades finished"),
                Err(e) => {
                    error!(error = %e, fatal = e.is_fatal(), "Host upgrades failed");
                    std::process::exit(1);
                }
            }
        }
        signal = shutdown_signal() => {
            signal?;
            info!("Received SIGINT/SIGTERM, shutting down");
        }
    }

    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
