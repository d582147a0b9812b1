use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::cache::Cache;
use crate::cache::locker::Locker;
use crate::metrics::ProxyMetrics;
use crate::routing::Router;

/// Spawns a background task that listens for SIGHUP (Unix) signals.
/// On SIGHUP, it re-reads the configuration and atomically swaps the
/// routing table via `ArcSwap`, so origin and path changes apply with
/// zero downtime. Caches, listeners, and the locker are not rebuilt;
/// changing those requires a restart.
pub fn spawn_reload_handler(
    router: Arc<ArcSwap<Router>>,
    caches: HashMap<String, Arc<dyn Cache>>,
    metrics: Arc<ProxyMetrics>,
    locker: Arc<Locker>,
    arguments: Vec<String>,
) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sighup =
                signal(SignalKind::hangup()).expect("Failed to register SIGHUP handler");

            loop {
                sighup.recv().await;
                info!("SIGHUP received — reloading configuration...");

                let cfg = match crate::config::load(&arguments) {
                    Ok((cfg, _)) => cfg,
                    Err(e) => {
                        error!("Reload aborted, configuration invalid: {}", e);
                        continue;
                    }
                };
                match Router::from_config(&cfg, &caches, Arc::clone(&metrics), Arc::clone(&locker))
                {
                    Ok(new_router) => {
                        info!(
                            "Config reloaded: {} origins, {} caches",
                            cfg.origins.len(),
                            cfg.caches.len(),
                        );
                        router.store(Arc::new(new_router));
                        info!("Routing table swap complete (zero-downtime reload).");
                    }
                    Err(e) => error!("Reload aborted, router rebuild failed: {}", e),
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On non-Unix platforms, SIGHUP is not available.
            tracing::warn!("Hot reload (SIGHUP) is only supported on Unix platforms.");
            let _ = (router, caches, metrics, locker, arguments);
            std::future::pending::<()>().await;
        }
    });
}
