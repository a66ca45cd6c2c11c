use std::{process, sync::OnceLock};

use iothub_agent::{
    agent::Agent, config::AgentConfig, logger::LoggerManager, print_error, status::StatusBoard,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<AgentConfig> = OnceLock::new();

pub fn config() -> &'static AgentConfig {
    CONFIG.get_or_init(|| {
        AgentConfig::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Logs every link transition until the runtime shuts down.
async fn watch_link(board: StatusBoard) {
    if board.wait_online().await {
        info!("Hub link established");
    } else {
        error!("Hub link could not be established, retry policy expired");
    }

    let mut rx = board.subscribe();
    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();
        if status.is_online() {
            info!("Hub link: {}", status);
        } else if status.is_fatal() {
            error!("Hub link: {}", status);
        } else {
            warn!("Hub link: {}", status);
        }
    }
}

#[tokio::main]
async fn main() {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting iothub-agent version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.client);

    let agent = Agent::new(cfg).unwrap_or_else(|e| {
        error!("Failed to create device client: {}", e);
        process::exit(1);
    });
    tokio::spawn(watch_link(agent.status()));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    agent.run(cancel).await;
    info!("Shutdown complete");
}
