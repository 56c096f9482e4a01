//! bmcfront Redfish server
//!
//! Run with: cargo run --features server --bin bmcfront-server
//!
//! Configuration: BMCFRONT_CONFIG (TOML file), PORT, RUST_LOG.
//!
//! The object bus is in-process, with a simulated IST mode manager answering
//! `SetISTMode` and publishing its `Status` changes.

use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bmcfront::bus::{BusValue, LocalBus, Signal};
use bmcfront::server::{router, AppState, IST_INTERFACE, IST_PATH, IST_SET_METHOD, IST_STATUS_IN_PROGRESS};
use bmcfront::Config;

const STATUS_PREFIX: &str = "xyz.openbmc_project.IstModeManager.Server.Status";

/// Answer SetISTMode and report InProgress, then the requested mode
fn simulate_ist_manager(bus: &LocalBus) {
    let emitter = bus.clone();
    bus.register_method(IST_INTERFACE, IST_SET_METHOD, move |call| {
        let enabled = call.args.first().and_then(BusValue::as_bool).unwrap_or(false);
        let target = if enabled { "Enabled" } else { "Disabled" };
        let bus = emitter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            bus.emit(Signal::properties_changed(IST_PATH, IST_INTERFACE, [("Status", IST_STATUS_IN_PROGRESS)]));
            tokio::time::sleep(Duration::from_secs(3)).await;
            bus.emit(Signal::properties_changed(
                IST_PATH,
                IST_INTERFACE,
                [("Status", format!("{STATUS_PREFIX}.{target}"))],
            ));
        });
        Ok(Vec::new())
    });
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let bus = LocalBus::new();
    simulate_ist_manager(&bus);

    let state = match AppState::new(&config, Arc::new(bus)) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "failed to initialize");
            std::process::exit(1);
        }
    };

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, version = env!("CARGO_PKG_VERSION"), "bmcfront-server listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
