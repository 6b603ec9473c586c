use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use medquest_gate::{build_router, config::AppConfig, db::DBLayer, payment::PaymentService, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // -----------------------------
    // Shared state / Dependencies
    // -----------------------------
    let config = AppConfig::from_env()?;
    let db = Arc::new(DBLayer::new(&config.db_path)?);
    let payment = PaymentService::from_env();
    if payment.is_none() {
        info!("stripe not configured; payment routes will answer 503");
    }

    let addr = config.bind_addr.clone();
    let state = AppState::new(db, config, payment);
    let app = build_router(state);

    info!(%addr, "access gate listening");
    info!("live gate channel at ws://{addr}/ws/access");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
