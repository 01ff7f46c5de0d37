/**
 * DRONO KERNEL - process entry point
 *
 * ROLE: loads config, builds the kernel over the ADB transport, starts the
 * background tasks (bus worker, broadcaster, optional MQTT bridge) and serves
 * the HTTP/WebSocket API.
 */

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use drono_kernel::config::load_config;
use drono_kernel::http::{build_router, AppState};
use drono_kernel::logging::init_logging;
use drono_kernel::mqtt::spawn_mqtt_bridge;
use drono_kernel::probe::AdbTransport;
use drono_kernel::Kernel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cfg = load_config().await;

    let adb = Arc::new(
        AdbTransport::new(cfg.adb.clone(), cfg.probes.timeouts()).context("invalid adb configuration")?,
    );
    if let Err(e) = adb.check_available().await {
        warn!("[kernel] adb not usable yet: {}", e);
    }

    let kernel = Kernel::build(&cfg, adb.clone(), adb.clone(), adb);
    let _tasks = kernel.start();

    if let Some(mqtt) = &cfg.mqtt {
        if let Err(e) = spawn_mqtt_bridge(mqtt, kernel.clone()) {
            warn!("[kernel] MQTT bridge disabled: {:#}", e);
        }
    }

    if cfg.api_key.is_none() {
        warn!("[kernel] no API key configured, HTTP API is open");
    }
    let app = build_router(AppState::new(
        kernel,
        cfg.api_key.clone(),
        cfg.broadcast.subscriber_queue,
    ));

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("cannot bind {}", cfg.listen))?;
    info!("[kernel] listening on http://{}", cfg.listen);
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
