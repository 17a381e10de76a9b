use crate::config::GatewayConfig;
use crate::events::TracingEventSink;
use crate::metrics::Metrics;
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: load, resolve, serve, shut down.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load(&args.config_path)?;
    let metrics = Metrics::install()?;
    let state = GatewayState::new(config, Some(metrics), Arc::new(TracingEventSink))?;

    // Registry failures only mark routes unresolved; the gateway still starts
    // and serves their fallbacks until the next refresh.
    state.refresh_routes().await?;
    tracing::info!("routing: initial resolve completed");

    let (shutdown_tx, shutdown) = watch::channel(false);
    start_refresh_loop(&state, &shutdown);
    start_reload_watcher(&state, args.config_path.clone(), &shutdown);
    start_admin_server(&state, &args);

    tracing::info!("server: starting gateway, listen={}", args.listen);
    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown_tx).await?;

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer must outlive every log call, i.e. the process.
    std::mem::forget(guard);
}

/// Sleep for `interval` (forever when zero). Returns `true` if shutdown was
/// signalled first, including before this call.
async fn wait_for_refresh(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let tick = async {
        if interval.is_zero() {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(interval).await
        }
    };
    tokio::select! {
        _ = tick => false,
        _ = shutdown.wait_for(|stop| *stop) => true,
    }
}

/// Periodically rebuild the route table from the registry.
fn start_refresh_loop(state: &GatewayState, shutdown: &watch::Receiver<bool>) {
    let state = state.clone();
    let mut shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let interval = state.config.load().registry.refresh_interval;
            if wait_for_refresh(interval, &mut shutdown).await {
                return;
            }

            let result = match state.refresh_routes().await {
                Ok(()) => "success",
                Err(e) => {
                    tracing::warn!("routing: refresh failed, error={}", e);
                    "error"
                }
            };
            metrics::counter!(
                "gateway_route_refresh_total",
                "trigger" => "interval",
                "result" => result,
            )
            .increment(1);
        }
    });
}

/// Reload the config file on SIGHUP.
#[cfg(unix)]
fn start_reload_watcher(
    state: &GatewayState,
    config_path: PathBuf,
    shutdown: &watch::Receiver<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let state = state.clone();
    let mut shutdown = shutdown.clone();

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("server: SIGHUP handler unavailable, reload disabled, error={}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = hangup.recv() => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }

            tracing::info!("server: received SIGHUP, reloading {}", config_path.display());
            let result = match reload_from(&state, &config_path).await {
                Ok(()) => "success",
                Err(e) => {
                    tracing::error!("server: reload failed, keeping current config, error={:#}", e);
                    "error"
                }
            };
            metrics::counter!(
                "gateway_config_reloads_total",
                "source" => "sighup",
                "result" => result,
            )
            .increment(1);
        }
    });
}

#[cfg(not(unix))]
fn start_reload_watcher(
    _state: &GatewayState,
    _config_path: PathBuf,
    _shutdown: &watch::Receiver<bool>,
) {
    tracing::info!("server: config reload on SIGHUP is not supported on this platform");
}

#[cfg(unix)]
async fn reload_from(state: &GatewayState, path: &std::path::Path) -> Result<()> {
    let config = GatewayConfig::load(path)?;
    state.reload(config).await
}

fn start_admin_server(state: &GatewayState, args: &BootstrapArgs) {
    let state = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, state).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &watch::Sender<bool>) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        res = ctrl_c => {
            res?;
            tracing::info!("server: received SIGINT, shutting down");
        }
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Stop the accept loop and the background tasks. The value sticks, so a
    // task that starts waiting later still sees it.
    shutdown.send_replace(true);
    Ok(())
}
