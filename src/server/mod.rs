pub mod bootstrap;
pub mod runtime;
mod state;
mod tls;

pub use state::{HttpClient, ProxyState};

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Bind the listen socket. Separate from [`serve`] so tests can bind port 0
/// and read the assigned address.
pub async fn bind(listen: &str) -> Result<TcpListener> {
    let addr: SocketAddr = listen.parse()?;
    Ok(TcpListener::bind(addr).await?)
}

/// Accept loop with graceful shutdown.
///
/// Cancelling `shutdown` stops accepting; each live connection's child token
/// is cancelled when the connection closes, which is how queued requests
/// observe that their client went away. In-flight requests get up to
/// `DRAIN_TIMEOUT` to finish.
pub async fn serve(
    listener: TcpListener,
    state: ProxyState,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls_acceptor = if state.config.tls.enabled {
        Some(tls::build_acceptor(&state.config.tls)?)
    } else {
        None
    };

    // Atomic mirror of the active-connection gauge (gauges are write-only).
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("proxy_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: accept failed, error={}", e);
                metrics::counter!("proxy_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("proxy_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let conn_token = shutdown.child_token();
        let acceptor = tls_acceptor.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        serve_connection(
                            TokioIo::new(tls_stream),
                            state,
                            peer_addr,
                            conn_token.clone(),
                            true,
                        )
                        .await
                    }
                    Err(e) => {
                        error!("server: tls handshake failed, peer={}, error={}", peer_addr, e);
                    }
                },
                None => {
                    serve_connection(
                        TokioIo::new(stream),
                        state,
                        peer_addr,
                        conn_token.clone(),
                        false,
                    )
                    .await
                }
            }

            // Connection gone: anything of its still waiting in the
            // admission queue observes cancellation through this token.
            conn_token.cancel();
            metrics::gauge!("proxy_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections to finish (or time out).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: waiting for {} active connections to drain", active);
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: all connections drained"),
            Err(_) => info!(
                "server: drain timeout ({}s), {} connections still active",
                DRAIN_TIMEOUT.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

async fn serve_connection<I>(
    io: TokioIo<I>,
    state: ProxyState,
    peer_addr: SocketAddr,
    token: CancellationToken,
    tls: bool,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let token = token.clone();
        async move { proxy::handle_request(req, state, peer_addr, token, tls).await }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
        .serve_connection(io, svc)
        .await
    {
        if !e.to_string().contains("connection closed") {
            error!("server: connection error, peer={}, error={}", peer_addr, e);
        }
    }
}
