//! Per-worker runtime: builds the plugin chain, wires the SMTP listener and
//! (when handed one) the control channel onto a fresh current-thread
//! runtime, and runs until a termination signal. Everything a worker
//! schedules is cooperative on this one thread; parallelism comes from
//! running more workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use tollgate_common::{config::Config, state::ServerState, Signal};
use tollgate_control::ControlServer;
use tollgate_hooks::dns::{Resolve, SystemResolver};
use tollgate_hooks::Dispatcher;
use tollgate_smtp::{Listener, Smtp, SmtpConfig};

use crate::cli::Cli;

pub fn run(
    cli: &Cli,
    smtp_listener: std::net::TcpListener,
    control_listener: Option<std::net::TcpListener>,
) -> anyhow::Result<()> {
    // A fresh runtime per worker: the epoll fd must never cross a fork.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cli, smtp_listener, control_listener))
}

async fn serve(
    cli: &Cli,
    smtp_listener: std::net::TcpListener,
    control_listener: Option<std::net::TcpListener>,
) -> anyhow::Result<()> {
    let config = Arc::new(Config::new(&cli.config_dir));
    let server_state = Arc::new(ServerState::new());
    let resolver: Arc<dyn Resolve> = Arc::new(SystemResolver::new(Duration::from_secs(5))?);

    let registry = Arc::new(tollgate_plugins::build_registry(
        &config,
        &cli.db_dir,
        Arc::clone(&resolver),
    ));
    tracing::info!(plugins = ?registry.plugin_names(), "plugin chain loaded");

    let smtp = Arc::new(Smtp {
        dispatcher: Dispatcher::new(registry),
        server: Arc::clone(&server_state),
        config: Arc::clone(&config),
        settings: SmtpConfig::from_config(&config),
    });

    let (shutdown_tx, _) = broadcast::channel::<Signal>(8);

    let listener = Listener::from_std(smtp_listener, Arc::clone(&smtp))?;

    let control = match control_listener {
        Some(listener) => {
            let reload = reload_fn(Arc::clone(&config), Arc::clone(&smtp), cli, resolver);
            Some(ControlServer::from_std(
                listener,
                Arc::clone(&server_state),
                reload,
            )?)
        }
        None => None,
    };

    let result = tokio::select! {
        r = listener.serve(shutdown_tx.subscribe()) => r.map_err(Into::into),
        r = serve_control(control.as_ref(), &shutdown_tx) => r,
        r = wait_for_termination() => {
            tracing::info!("termination signal, shutting down");
            let _ = shutdown_tx.send(Signal::Shutdown);
            r
        }
    };

    result
}

/// The control channel's `reload`: drop the config cache and swap in a
/// freshly built plugin chain. Sessions mid-hook finish on the old chain.
fn reload_fn(
    config: Arc<Config>,
    smtp: Arc<Smtp>,
    cli: &Cli,
    resolver: Arc<dyn Resolve>,
) -> Arc<dyn Fn() + Send + Sync> {
    let db_dir = cli.db_dir.clone();
    Arc::new(move || {
        config.reload();
        let registry = Arc::new(tollgate_plugins::build_registry(
            &config,
            &db_dir,
            Arc::clone(&resolver),
        ));
        tracing::info!(plugins = ?registry.plugin_names(), "plugin chain rebuilt");
        smtp.dispatcher.swap(registry);
    })
}

async fn serve_control(
    control: Option<&ControlServer>,
    shutdown: &broadcast::Sender<Signal>,
) -> anyhow::Result<()> {
    match control {
        Some(server) => server.serve(shutdown.subscribe()).await.map_err(Into::into),
        None => std::future::pending().await,
    }
}

async fn wait_for_termination() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.map_err(Into::into),
        _ = terminate.recv() => Ok(()),
    }
}
