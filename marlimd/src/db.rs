//! Database subcommands (feature `postgres`).
//!
//! ```bash
//! marlimd db migrate   # apply the schema (idempotent)
//! marlimd db status    # connectivity + table row counts
//! ```
//!
//! Migrations preserve the append-only nature of `events` and the
//! `(intents.id, position_id)` uniqueness; the schema uses
//! `CREATE ... IF NOT EXISTS` throughout.

use anyhow::{bail, Context};
use marlim_lease::PgLeaseManager;
use marlim_store::PgStore;
use sqlx::PgPool;
use tracing::info;

pub async fn run_db_command(args: Vec<String>) -> anyhow::Result<()> {
    let subcommand = args.get(2).map(String::as_str).unwrap_or("");

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL is required for db commands")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("connecting to PostgreSQL")?;

    match subcommand {
        "migrate" => {
            let store = PgStore::new(pool.clone());
            store.migrate().await.context("applying store schema")?;

            let leases = PgLeaseManager::new(pool);
            leases
                .init_schema()
                .await
                .map_err(|e| anyhow::anyhow!("applying lease schema: {}", e))?;

            info!("Schema migrated");
            println!("migrated");
            Ok(())
        },

        "status" => {
            let tables = ["positions", "events", "orders", "intents", "leases"];
            for table in tables {
                let count: Result<(i64,), _> =
                    sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                        .fetch_one(&pool)
                        .await;
                match count {
                    Ok((n,)) => println!("{:<10} {:>8} rows", table, n),
                    Err(_) => println!("{:<10}  missing", table),
                }
            }
            Ok(())
        },

        other => bail!("unknown db subcommand: {:?} (expected migrate|status)", other),
    }
}
