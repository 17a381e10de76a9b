mod admin;
pub mod bootstrap;
mod state;

pub use state::{GatewayDispatcher, GatewayState};

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the proxy listener until `shutdown` turns `true` (or its sender is
/// dropped), then stop accepting and give open connections up to
/// `DRAIN_TIMEOUT` to finish.
pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);

    // metrics gauges are write-only, so keep our own count for the drain.
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("server: proxy: stop accepting new connections, draining");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("gateway_connections_total", "status" => "accepted")
                    .increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("gateway_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("gateway_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let dispatcher = state.dispatcher.clone();
        let config = state.config.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let dispatcher = dispatcher.clone();
                let max_body_bytes = config.load().max_body_bytes;
                async move {
                    proxy::handle_request(req, dispatcher, peer_addr, max_body_bytes).await
                }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)))
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("gateway_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    drain(&active_conns).await;
    Ok(())
}

async fn drain(active_conns: &AtomicI64) {
    let active = active_conns.load(Ordering::Relaxed);
    if active == 0 {
        return;
    }
    info!(
        "server: proxy: waiting for {} active connections to drain",
        active
    );

    let wait = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, wait).await {
        Ok(()) => info!("server: proxy: all connections drained"),
        Err(_) => info!(
            "server: proxy: drain timeout ({}s), {} connections still active",
            DRAIN_TIMEOUT.as_secs(),
            active_conns.load(Ordering::Relaxed)
        ),
    }
}

/// Admin listener: health, readiness, metrics, route and breaker status.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, hyper::Error>(admin::handle_admin(req.uri().path(), &state)) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
