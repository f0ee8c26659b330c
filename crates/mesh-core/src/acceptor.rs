//! TCP accept loop, connection admission, and background maintenance tasks
//! (§4.6 Acceptor).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::envelope::{ErrorCode, ErrorData, Envelope, NetworkMessageType};
use crate::handler::{handle_connection, SharedState};
use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiter;

/// Runtime configuration for the accept loop and its background tasks.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Address to bind, e.g. `0.0.0.0`.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Reject new sockets once this many connections are registered
    /// (authenticated or still handshaking).
    pub max_connections: usize,
    /// How often the idle-sweep background task runs.
    pub idle_sweep_interval: Duration,
    /// How often the stats-tick background task runs.
    pub stats_tick_interval: Duration,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7777,
            max_connections: 1000,
            idle_sweep_interval: Duration::from_secs(60),
            stats_tick_interval: Duration::from_secs(30),
        }
    }
}

/// Bind and run the accept loop until `shutdown` fires.
///
/// # Errors
///
/// Returns an I/O error if the listener cannot be bound.
pub async fn run(
    config: AcceptorConfig,
    shared: Arc<SharedState>,
    rate_limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "mesh server listening");

    let idle_dispatcher = shared.dispatcher.clone();
    let max_idle = shared.connection_timeout * 2;
    let mut idle_shutdown = shutdown.clone();
    tokio::spawn(async move {
        idle_sweep_loop(config.idle_sweep_interval, idle_dispatcher, max_idle, &mut idle_shutdown).await;
    });

    let sweep_limiter = rate_limiter.clone();
    let limiter_sweep_interval = sweep_limiter.sweep_interval();
    let mut limiter_shutdown = shutdown.clone();
    tokio::spawn(async move {
        rate_limiter_sweep_loop(limiter_sweep_interval, sweep_limiter, &mut limiter_shutdown).await;
    });

    let stats_shared = shared.clone();
    let mut stats_shutdown = shutdown.clone();
    tokio::spawn(async move {
        stats_tick_loop(config.stats_tick_interval, stats_shared, &mut stats_shutdown).await;
    });

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("acceptor shutting down, no longer accepting new connections");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };

                if shared.dispatcher.len() >= config.max_connections {
                    tokio::spawn(reject_max_connections(stream));
                    continue;
                }

                let connection_id = shared.dispatcher.next_connection_id();
                let shared = shared.clone();
                info!(connection_id, %peer_addr, "accepted connection");
                tokio::spawn(async move {
                    handle_connection(stream, connection_id, shared).await;
                });
            }
        }
    }

    Ok(())
}

async fn reject_max_connections(stream: tokio::net::TcpStream) {
    use tokio::io::AsyncWriteExt;

    let data = ErrorData {
        code: ErrorCode::MaxConnections.as_str().to_string(),
        message: "server at capacity".to_string(),
        details: None,
    };
    let Ok(envelope) = Envelope::new(NetworkMessageType::Error, "server", &data, 0, None) else {
        return;
    };
    let Ok(mut line) = serde_json::to_string(&envelope) else {
        return;
    };
    line.push('\n');

    let mut stream = stream;
    let _ = stream.write_all(line.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Close registered connections whose `lastActivity` is older than
/// `max_idle` (§4.6). Runs on `interval`, independent of the RateLimiter's
/// own bucket-GC cadence.
async fn idle_sweep_loop(
    interval: Duration,
    dispatcher: Arc<Dispatcher>,
    max_idle: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let closed = dispatcher.close_idle_connections(max_idle);
                if closed > 0 {
                    info!(closed, "idle sweep closed stale connections");
                }
            }
        }
    }
}

/// Reclaim stale rate-limiter buckets (§4.5) on `interval`, which should be
/// `2 * rate_limit_window` — unrelated to the idle sweep's own cadence.
async fn rate_limiter_sweep_loop(interval: Duration, rate_limiter: Arc<RateLimiter>, shutdown: &mut watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                rate_limiter.sweep();
            }
        }
    }
}

async fn stats_tick_loop(interval: Duration, shared: Arc<SharedState>, shutdown: &mut watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let snapshot = shared.metrics.snapshot();
                info!(
                    connections = shared.dispatcher.len(),
                    connections_accepted = snapshot.connections_accepted,
                    connections_closed = snapshot.connections_closed,
                    messages_processed = snapshot.messages_processed,
                    messages_failed = snapshot.messages_failed,
                    rate_limited = snapshot.rate_limited,
                    "stats tick"
                );
            }
        }
    }
}

/// Graceful shutdown: flip the shared signal, then wait up to `timeout` for
/// every registered connection to drain.
pub async fn graceful_shutdown(shutdown_tx: &watch::Sender<bool>, dispatcher: &Arc<Dispatcher>, timeout: Duration) {
    let _ = shutdown_tx.send(true);
    let deadline = tokio::time::Instant::now() + timeout;
    while dispatcher.len() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if dispatcher.len() > 0 {
        error!(remaining = dispatcher.len(), "shutdown timed out with connections still open");
    }
}
