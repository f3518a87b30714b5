//! Marlim daemon entrypoint.
//!
//! # Usage
//!
//! ```bash
//! # Paper mode (stub exchange, in-memory store)
//! marlimd
//!
//! # Live mode against Binance isolated margin
//! MARLIM_ENV=live BINANCE_API_KEY=... BINANCE_API_SECRET=... marlimd
//!
//! # Database schema (requires the postgres feature and DATABASE_URL)
//! marlimd db migrate
//! ```
//!
//! # Environment variables
//!
//! - `MARLIM_ENV`: paper | live | test (default paper)
//! - `MARLIM_API_HOST` / `MARLIM_API_PORT` (default 0.0.0.0:8080)
//! - `MARLIM_RISK_FRACTION_PCT` (default 1)
//! - `MARLIM_FILL_TOLERANCE_PCT` (default 0.5)
//! - `MARLIM_INSURANCE_ENABLED` / `MARLIM_INSURANCE_BUFFER_PCT`
//! - `MARLIM_SAFETY_POLL_SECS` (default 20) / `MARLIM_SAFETY_STOP_PCT` (default 2)
//! - `MARLIM_LEASE_TTL_SECS` (default 30)
//! - `DATABASE_URL`: PostgreSQL connection string
//! - `BINANCE_API_KEY` / `BINANCE_API_SECRET`: live mode credentials

#[cfg(feature = "postgres")]
mod db;

use marlimd::{Config, Daemon, Environment};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("marlimd=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    #[cfg(feature = "postgres")]
    if args.len() > 1 && args[1] == "db" {
        return db::run_db_command(args).await;
    }

    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        "marlimd"
    );

    match config.environment {
        Environment::Live => {
            let api_key = std::env::var("BINANCE_API_KEY")
                .map_err(|_| anyhow::anyhow!("BINANCE_API_KEY required in live mode"))?;
            let api_secret = std::env::var("BINANCE_API_SECRET")
                .map_err(|_| anyhow::anyhow!("BINANCE_API_SECRET required in live mode"))?;

            let exchange = std::sync::Arc::new(marlim_connectors::BinanceExchange::new(
                api_key, api_secret,
            ));
            let market = std::sync::Arc::new(marlim_connectors::BinanceMarketData::new(false));

            #[cfg(feature = "postgres")]
            if let Some(database_url) = &config.database_url {
                let pool = sqlx::PgPool::connect(database_url).await?;
                let store = std::sync::Arc::new(marlim_store::PgStore::new(pool.clone()));
                let lease_manager: std::sync::Arc<dyn marlim_lease::LeaseManager> =
                    std::sync::Arc::new(marlim_lease::PgLeaseManager::new(pool));
                let daemon = Daemon::assemble(
                    config,
                    exchange,
                    market,
                    store,
                    lease_manager,
                    uuid::Uuid::now_v7(),
                );
                return Ok(daemon.run().await?);
            }

            let store = std::sync::Arc::new(marlim_store::MemoryStore::new());
            let lease_manager: std::sync::Arc<dyn marlim_lease::LeaseManager> =
                std::sync::Arc::new(marlim_lease::MemoryLeaseManager::new());
            let daemon = Daemon::assemble(
                config,
                exchange,
                market,
                store,
                lease_manager,
                uuid::Uuid::now_v7(),
            );
            daemon.run().await?;
        },
        _ => {
            let daemon = Daemon::new_paper(config);
            daemon.run().await?;
        },
    }

    Ok(())
}
