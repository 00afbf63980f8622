//! The flowhub binary: config, wiring, worker pools, crons, web surface
//! and signal-driven graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use flowhub::engine::exec::LinearEngine;
use flowhub::tasks::{cron, WorkerPool};
use flowhub::{queue, web, Config, Runtime};

#[derive(Parser)]
#[command(name = "flowhub", about = "Event handling and flow execution backend")]
struct Cli {
    /// path to the TOML config file
    #[arg(long, env = "FLOWHUB_CONFIG")]
    config: Option<PathBuf>,

    /// override the database URL
    #[arg(long, env = "FLOWHUB_DATABASE_URL")]
    database_url: Option<String>,

    /// override the web bind address
    #[arg(long)]
    address: Option<String>,

    /// override the web port
    #[arg(long)]
    port: Option<u16>,

    /// override the log level
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("flowhub: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("error loading config")?;
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }
    if let Some(address) = cli.address {
        config.address = address;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    flowhub::logging::init(&config.log_level, config.log_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error building runtime")?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let grace = std::time::Duration::from_secs(config.shutdown_grace);

    let mut rt = Runtime::create(config, Arc::new(LinearEngine::new()))
        .await
        .context("error creating runtime")?;
    flowhub::wire(&mut rt);
    let rt = Arc::new(rt);

    info!(
        handler_workers = rt.config.handler_workers,
        batch_workers = rt.config.batch_workers,
        "flowhub starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let handler_pool = WorkerPool::start(rt.clone(), queue::HANDLER, rt.config.handler_workers);
    let batch_pool = WorkerPool::start(rt.clone(), queue::BATCH, rt.config.batch_workers);
    let crons = cron::start(rt.clone(), shutdown_rx.clone());

    let web_handle = {
        let rt = rt.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = web::serve(rt, shutdown_rx).await {
                error!(error = %err, "web server exited");
            }
        })
    };

    wait_for_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);

    // workers get a grace period to finish in-flight tasks
    let drained = tokio::time::timeout(grace, async {
        handler_pool.stop().await;
        batch_pool.stop().await;
    })
    .await;
    if drained.is_err() {
        error!("shutdown grace period expired with tasks in flight");
    }

    for handle in crons {
        handle.abort();
    }
    let _ = web_handle.await;

    info!("flowhub stopped");
    Ok(())
}

async fn wait_for_signal() {
    let mut interrupt = signal(SignalKind::interrupt()).expect("error installing signal handler");
    let mut terminate = signal(SignalKind::terminate()).expect("error installing signal handler");

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}
