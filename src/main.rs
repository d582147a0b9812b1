use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use trickster::cache::locker::Locker;
use trickster::config::{APPLICATION_NAME, APPLICATION_VERSION};
use trickster::{cache, config, metrics, reload, routing, telemetry};

/// Exit codes: 0 normal, 1 configuration error, 2 bind failure.
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;

/// A synchronous `main` so the configuration is parsed before the async
/// runtime is built.
fn main() {
    let arguments: Vec<String> = std::env::args().skip(1).collect();

    let (cfg, flags) = match config::load(&arguments) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Could not load configuration: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if flags.print_version {
        println!("{}", APPLICATION_VERSION);
        return;
    }

    telemetry::init_telemetry(&cfg.logging.log_level);
    tracing::info!(
        name = APPLICATION_NAME,
        version = APPLICATION_VERSION,
        "application start up"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build async runtime");

    let exit_code = rt.block_on(async {
        // A CancellationToken propagates shutdown to the accept loop,
        // cache reapers, and index flushers.
        let shutdown_token = CancellationToken::new();
        let shutdown_signal_token = shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received — initiating graceful shutdown...");
            shutdown_signal_token.cancel();
        });

        let proxy_metrics = Arc::new(metrics::ProxyMetrics::new());
        let locker = Locker::new();

        let caches = match cache::load_caches_from_config(
            &cfg,
            Arc::clone(&proxy_metrics),
            shutdown_token.clone(),
        )
        .await
        {
            Ok(caches) => caches,
            Err(e) => {
                tracing::error!("Could not initialize caches: {}", e);
                return EXIT_CONFIG;
            }
        };

        let router = match routing::Router::from_config(
            &cfg,
            &caches,
            Arc::clone(&proxy_metrics),
            Arc::clone(&locker),
        ) {
            Ok(router) => Arc::new(ArcSwap::from_pointee(router)),
            Err(e) => {
                tracing::error!("Could not build routing table: {}", e);
                return EXIT_CONFIG;
            }
        };

        // SIGHUP swaps the routing table in place
        reload::spawn_reload_handler(
            Arc::clone(&router),
            caches.clone(),
            Arc::clone(&proxy_metrics),
            Arc::clone(&locker),
            arguments.clone(),
        );

        // metrics/health listener on its own port
        let metrics_bind = format!(
            "{}:{}",
            cfg.metrics.listen_address, cfg.metrics.listen_port
        );
        let metrics_for_server = Arc::clone(&proxy_metrics);
        tokio::spawn(async move {
            metrics::start_metrics_server(metrics_bind, metrics_for_server).await;
        });

        let tls_acceptor = match trickster::proxy::tls::load_tls_acceptor(&cfg.origins) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                tracing::error!("Could not configure TLS: {}", e);
                return EXIT_CONFIG;
            }
        };
        let frontend_bind = format!(
            "{}:{}",
            cfg.frontend.listen_address, cfg.frontend.listen_port
        );
        if let Err(e) =
            routing::start_frontend(frontend_bind, router, tls_acceptor, shutdown_token.clone())
                .await
        {
            tracing::error!("Frontend failed to start: {}", e);
            return EXIT_BIND;
        }

        for (name, cache) in &caches {
            if let Err(e) = cache.close().await {
                tracing::warn!(cache = %name, "cache close failed: {}", e);
            }
        }
        0
    });

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

/// Waits for Ctrl+C or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => { tracing::info!("Received Ctrl+C"); }
            _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("Failed to listen for Ctrl+C");
    }
}
