use crate::config::ProxyConfig;
use crate::server::{self, ProxyState};
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
}

/// Proxy lifecycle: init logging → load config → build state → serve →
/// drain on signal.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = ProxyConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
        config.normalize();
    }

    let state = ProxyState::new(config)?;
    let shutdown = CancellationToken::new();

    let listener = server::bind(&state.config.listen).await?;
    tracing::info!("server: proxy listening, addr={}", listener.local_addr()?);

    let serve_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::serve(listener, state, shutdown).await }
    });

    wait_for_shutdown().await;
    shutdown.cancel();

    match serve_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
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

    std::mem::forget(_guard);
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
