mod cli;
mod config;
mod shutdown;
mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use meeseeks_core::Config;
use meeseeks_engine::{tls, BoxNode, RequestHandler, State};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::DaemonConfig;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let raw = std::fs::read_to_string(&cli.config)
        .map_err(|err| anyhow::anyhow!("failed to read config {}: {err}", cli.config.display()))?;
    let app_config = Config::load(&raw)?;
    let daemon_cfg = DaemonConfig::from_config(
        &app_config,
        cli.name.clone(),
        cli.listen_address.clone(),
        cli.listen_port,
    )?;
    let name = daemon_cfg.name.clone();

    let state = State::new(Some(name.clone()), daemon_cfg.state.clone())?;
    let router = Arc::new(BoxNode::new(
        name.clone(),
        state.clone(),
        daemon_cfg.router,
        app_config,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut background = Vec::new();

    background.push(tokio::spawn({
        let state = state.clone();
        let rx = shutdown_rx.clone();
        async move { state.run(rx).await }
    }));
    background.push(tokio::spawn({
        let router = router.clone();
        let rx = shutdown_rx.clone();
        async move { router.run(rx).await }
    }));

    let supervisor = Arc::new(Supervisor::new(state.clone(), router.clone()));
    supervisor.apply(&name, &daemon_cfg);

    background.push(tokio::spawn({
        let supervisor = supervisor.clone();
        let name = name.clone();
        let rx = shutdown_rx.clone();
        async move { supervisor.watch_reload(name, rx).await }
    }));

    let listen_addr: SocketAddr = format!("{}:{}", daemon_cfg.listen.address, daemon_cfg.listen.port).parse()?;
    let tls_acceptor = tls::build_listener_acceptor(daemon_cfg.listen.tls.as_ref())?;
    let handler = RequestHandler::new(state.clone(), router.clone());
    background.push(tokio::spawn({
        let rx = shutdown_rx.clone();
        async move {
            if let Err(err) = meeseeks_engine::router::serve(listen_addr, tls_acceptor, handler, rx).await {
                tracing::error!(error = %err, "listener exited with error");
            }
        }
    }));

    let shutdown_ctl = Arc::new(ShutdownController::new());
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown_ctl, event_tx);

    tracing::info!(name = %name, addr = %listen_addr, "meeseeksd started");

    loop {
        match event_rx.recv().await {
            Some(ShutdownEvent::Graceful) => {
                tracing::info!("shutdown requested, draining");
                let _ = shutdown_tx.send(true);
                break;
            }
            Some(ShutdownEvent::Immediate) => {
                tracing::warn!("forced immediate shutdown");
                std::process::exit(130);
            }
            None => break,
        }
    }

    for task in background {
        let _ = task.await;
    }
    supervisor.shutdown().await;

    tracing::info!("meeseeksd stopped");
    Ok(())
}

fn init_logging(verbose: u8) {
    let default_directive = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,meeseeksd={default_directive},meeseeks_engine={default_directive},meeseeks_core={default_directive}"
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
