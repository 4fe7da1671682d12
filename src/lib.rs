//! trafficctl -- session-pooled orchestration driver for traffic-generator
//! test controllers.
//!
//! This crate provides the appliance session pool, remote configuration
//! fetching, the per-reservation lifecycle controller, results collection
//! and the command facade the orchestration platform calls into.

pub mod api;
pub mod appliance;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod platform;
pub mod reservation;
pub mod results;
pub mod session;
pub mod transfer;

use std::sync::Arc;

use anyhow::Result;

use crate::config::DriverConfig;
use crate::driver::TrafficControllerDriver;
use crate::platform::http::HttpPlatform;

/// Start the driver daemon: the control API backed by a platform-connected
/// driver. Returns after a shutdown signal, once the session pool is closed.
pub async fn serve(bind: &str, config: DriverConfig) -> Result<()> {
    let platform = Arc::new(HttpPlatform::new(&config));
    let driver = Arc::new(TrafficControllerDriver::new(config, platform)?);

    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState::new(driver.clone()));

    tracing::info!(%addr, "trafficctl listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    driver.shutdown().await;
    Ok(())
}
