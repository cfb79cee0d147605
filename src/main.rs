use anyhow::Result;
use clap::Parser;
use cliproxy::cli::{families_for, Cli, Commands};
use cliproxy::config::ConfigStore;
use cliproxy::family::Family;
use cliproxy::server;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "cliproxy=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("Fatal: {:#}", err);
            1
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Some(Commands::Config { .. }) => {
            let store = ConfigStore::open_default()?;
            println!("{}", store.root().display());
            Ok(0)
        }
        Some(Commands::Serve { family }) => {
            let families =
                families_for(family.as_deref()).map_err(|msg| anyhow::anyhow!(msg))?;
            serve(families).await
        }
        None => serve(Family::ALL.to_vec()).await,
    }
}

/// Run the requested family services until Ctrl-C or failure.
///
/// Exit codes: 0 clean shutdown, 1 fatal error in one service (port in
/// use, config directory unavailable), 2 forced exit when several
/// services die.
async fn serve(families: Vec<Family>) -> Result<i32> {
    let store = Arc::new(ConfigStore::open_default()?);

    let mut shutdowns = Vec::new();
    let mut handles = Vec::new();
    for family in families {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        shutdowns.push(shutdown_tx);
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            server::run_family(family, store, shutdown_rx).await
        }));
    }

    let mut servers = Box::pin(futures::future::join_all(handles));

    let results = tokio::select! {
        results = &mut servers => results,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
            for shutdown in shutdowns {
                let _ = shutdown.send(());
            }
            servers.await
        }
    };

    let mut failures = 0;
    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!("Service error: {:#}", err);
                failures += 1;
            }
            Err(err) => {
                tracing::error!("Service task panicked: {}", err);
                failures += 1;
            }
        }
    }

    Ok(match failures {
        0 => 0,
        1 => 1,
        _ => 2,
    })
}
