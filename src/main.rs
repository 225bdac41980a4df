use clap::Parser;
use color_eyre::Result;
use serial_gateway::{cli, dispatcher::Dispatcher, logging, serial};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut cli = cli::Cli::parse();

    if let Some(command) = cli.command.take() {
        cli::handle_command(command)?;

        return Ok(());
    }

    logging::init(cli.stdout_level(), cli.file_logging()).await;

    let config = match cli.config() {
        Ok(config) => config,
        Err(e) => {
            error!(?e, "Bad configuration");
            return Err(e.into());
        }
    };

    serial::log_available_ports();

    let dispatcher = match Dispatcher::from_config(&config).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(?e, "Could not start");
            return Err(e.into());
        }
    };

    let shutdown = CancellationToken::new();
    let mut dispatching = tokio::spawn(dispatcher.run(shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = terminated() => {
            info!("Told to terminate, quitting")
        }
        _ = &mut dispatching => {
            warn!("Dispatcher returned");
            return Ok(());
        }
    }

    shutdown.cancel();

    if let Err(e) = dispatching.await {
        error!(?e, "Dispatcher did not shut down cleanly");
    }

    info!("Bye");

    Ok(())
}

#[cfg(unix)]
async fn terminated() {
    let (Ok(mut terminate), Ok(mut hangup)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        error!("Could not listen for signals, only Ctrl-C works");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
}

#[cfg(not(unix))]
async fn terminated() {
    std::future::pending().await
}
