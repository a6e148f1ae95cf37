use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use gridlock::engine::Engine;
use gridlock::{http, reaper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("GRIDLOCK_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    gridlock::observability::init(metrics_port);

    let port = std::env::var("GRIDLOCK_PORT").unwrap_or_else(|_| "3001".into());
    let bind = std::env::var("GRIDLOCK_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("GRIDLOCK_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact_threshold: u64 = std::env::var("GRIDLOCK_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let grid_rows: u16 = std::env::var("GRIDLOCK_GRID_ROWS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let grid_cols: u16 = std::env::var("GRIDLOCK_GRID_COLS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("gridlock.wal");

    let engine = Arc::new(Engine::new(wal_path)?);
    let seeded = engine.seed_grid(grid_rows, grid_cols).await?;
    if seeded > 0 {
        info!("seeded {seeded} machines ({grid_rows}x{grid_cols} grid)");
    }

    tokio::spawn(reaper::run_reaper(engine.clone()));
    tokio::spawn(reaper::run_compactor(engine.clone(), compact_threshold));

    let app = http::build_router(engine)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("gridlock listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  grid: {grid_rows}x{grid_cols}");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("gridlock stopped");
    Ok(())
}

/// Resolve on SIGTERM or ctrl-c so in-flight requests drain before exit.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
