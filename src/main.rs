//! portside demo server.
//!
//! Serves a small route table over the embeddable runtime:
//! - `GET /` and `GET /status` as plain HTTP endpoints
//! - `GET /echo` as a WebSocket endpoint echoing raw bytes
//!
//! Configuration comes from CLI arguments or a TOML file; a background task
//! logs the connection metrics report periodically.

use portside::{Config, Response, Route, RouteTable, Server};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_keep_alives = config.max_keep_alives,
        max_connections = config.max_connections,
        read_timeout_ms = config.read_timeout_ms,
        "Starting portside server"
    );

    let server = Server::new(config.server_config()?);

    let table = RouteTable::new(vec![
        Route::get("/", |_| Response::text("portside")),
        Route::get("/status", |_| {
            Response::json(&serde_json::json!({ "status": "up" }))
        }),
        Route::websocket("/echo", |mut session| {
            info!(websocket_id = session.id(), "WebSocket session accepted");
            tokio::spawn(async move {
                // raw byte echo; framing is the embedder's concern
                let mut buf = [0u8; 1024];
                loop {
                    match session.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if session.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                session.close().await;
            });
        }),
    ]);

    server.start(table)?;

    // periodic metrics summary
    let reporter = server.clone();
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(Duration::from_secs(30));
        ticks.tick().await; // skip the immediate first tick
        loop {
            ticks.tick().await;
            match reporter.metrics_report() {
                Ok(report) => match serde_json::to_string(&report) {
                    Ok(json) => info!(report = %json, "Connection metrics"),
                    Err(e) => error!(error = %e, "Failed to serialize metrics report"),
                },
                Err(e) => error!(error = %e, "Failed to take metrics report"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.shutdown();
    Ok(())
}
