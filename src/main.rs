use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use onhost_gateway::cli::Cli;
use onhost_gateway::config::{self, split_cmdline};
use onhost_gateway::supervisor::{OnDemandSupervisor, PausableSupervisor};
use onhost_gateway::{logging, Coordinator, Dispatcher};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref().unwrap_or("info"));

    let loaded = match config::load(&cli.config) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!(%err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let coordinator = Arc::new(Coordinator::new());

    for entry in loaded.pausable {
        let supervisor = PausableSupervisor::new(
            entry.name,
            split_cmdline(&entry.cmdline),
            PathBuf::from(entry.workdir),
        );
        coordinator.add_pausable(supervisor).await;
    }

    let mut dispatchers = Vec::new();
    for dispatcher_config in loaded.dispatchers {
        let mut pool = Vec::new();
        for entry in dispatcher_config.backends {
            let body_regex = match entry.body_regex {
                Some(pattern) => match regex::Regex::new(&pattern) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        error!(%err, entry = %entry.name, "invalid body_regex");
                        return ExitCode::FAILURE;
                    }
                },
                None => None,
            };
            let supervisor = OnDemandSupervisor::new(
                entry.name,
                split_cmdline(&entry.cmdline),
                PathBuf::from(entry.workdir),
                entry.endpoint,
                std::time::Duration::from_secs(entry.timeout * 60),
                entry.conflicts_with,
                body_regex,
            );
            coordinator.add_ondemand(supervisor.clone()).await;
            pool.push(supervisor);
        }
        dispatchers.push(Dispatcher::new(
            dispatcher_config.port,
            dispatcher_config.path,
            coordinator.clone(),
            pool,
        ));
    }

    if dispatchers.is_empty() {
        error!("configuration declares no on-demand backends; nothing to dispatch");
        return ExitCode::FAILURE;
    }

    coordinator.resume_all().await;

    let servers = dispatchers.into_iter().map(|dispatcher| async move {
        if let Err(err) = dispatcher.serve().await {
            error!(%err, "dispatcher exited with an error");
        }
    });

    info!("onhost-gateway running");
    tokio::select! {
        _ = futures::future::join_all(servers) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    ExitCode::SUCCESS
}
