use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use bookd::config::Config;
use bookd::engine::Engine;
use bookd::notify::NotifyHub;
use bookd::observability;
use bookd::reaper;
use bookd::store::{BookingRepository, LocalStore};
use bookd::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init_logging();

    let cfg = Config::from_env()?;
    observability::init_metrics(cfg.metrics_port)?;

    let store = if cfg.in_memory {
        Arc::new(LocalStore::in_memory())
    } else {
        std::fs::create_dir_all(&cfg.data_dir)?;
        let store = Arc::new(LocalStore::open(cfg.wal_path())?);
        info!("recovered {} booking(s) from {}", store.len(), cfg.wal_path().display());
        tokio::spawn(reaper::run_compactor(store.clone(), cfg.compact_threshold));
        store
    };

    let repo: Arc<dyn BookingRepository> = store;
    let engine = Arc::new(Engine::new(repo, Arc::new(NotifyHub::new())));
    if let Some(every) = cfg.auto_complete_every {
        tokio::spawn(reaper::run_completer(engine.clone(), every));
    }

    let max_connections = cfg.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = cfg.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("bookd listening on {addr}");
    if cfg.in_memory {
        info!("  storage: in-memory");
    } else {
        info!("  data_dir: {}", cfg.data_dir.display());
    }
    info!("  max_connections: {max_connections}");
    info!(
        "  auto-complete: {}",
        cfg.auto_complete_every
            .map_or("disabled".to_string(), |d| format!("every {}s", d.as_secs()))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let timeout = cfg.request_timeout;

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, timeout).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("bookd stopped");
    Ok(())
}
