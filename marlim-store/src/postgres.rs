//! PostgreSQL store implementation.
//!
//! One transaction per append: the event insert and the snapshot upsert
//! commit together. The `events` table is append-only: there is no UPDATE
//! or DELETE path anywhere in this module, and migrations must keep it
//! that way.
//!
//! The snapshot row carries queryable scalar columns plus the full typed
//! snapshot in `state_data`; the scalars are derived, the event log stays
//! authoritative.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marlim_domain::{
    Event, Intent, IntentId, IntentStatus, Order, OrderId, Position, PositionId, Side, Symbol,
};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::repository::{
    EventRepository, IntentRepository, OrderRepository, PositionRepository, Store,
};

/// Schema DDL, applied by `marlimd db migrate`.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS positions (
    id                      UUID PRIMARY KEY,
    account_id              UUID NOT NULL,
    symbol                  TEXT NOT NULL,
    side                    TEXT NOT NULL,
    state                   TEXT NOT NULL,
    entry_price             NUMERIC,
    tech_stop_distance      NUMERIC NOT NULL,
    tech_stop_distance_pct  NUMERIC,
    quantity                NUMERIC,
    realized_pnl            NUMERIC NOT NULL DEFAULT 0,
    fees_paid               NUMERIC NOT NULL DEFAULT 0,
    entry_order_id          TEXT,
    exit_order_id           TEXT,
    binance_position_id     TEXT,
    state_data              JSONB NOT NULL,
    created_at              TIMESTAMPTZ NOT NULL,
    updated_at              TIMESTAMPTZ NOT NULL,
    closed_at               TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_positions_account ON positions (account_id);
CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions (symbol);
CREATE INDEX IF NOT EXISTS idx_positions_state ON positions (state);
CREATE INDEX IF NOT EXISTS idx_positions_created ON positions (created_at);

CREATE TABLE IF NOT EXISTS events (
    seq         BIGSERIAL PRIMARY KEY,
    position_id UUID NOT NULL,
    event_type  TEXT NOT NULL,
    event_data  JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_position ON events (position_id);
CREATE INDEX IF NOT EXISTS idx_events_created ON events (created_at);

CREATE TABLE IF NOT EXISTS orders (
    id                UUID PRIMARY KEY,
    position_id       UUID NOT NULL,
    exchange_order_id TEXT,
    client_order_id   TEXT NOT NULL,
    symbol            TEXT NOT NULL,
    side              TEXT NOT NULL,
    order_type        TEXT NOT NULL,
    quantity          NUMERIC NOT NULL,
    price             NUMERIC,
    stop_price        NUMERIC,
    status            TEXT NOT NULL,
    filled_quantity   NUMERIC,
    fill_price        NUMERIC,
    filled_at         TIMESTAMPTZ,
    fee_paid          NUMERIC,
    order_data        JSONB NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_position ON orders (position_id);
CREATE INDEX IF NOT EXISTS idx_orders_client ON orders (client_order_id);
CREATE INDEX IF NOT EXISTS idx_orders_exchange ON orders (exchange_order_id);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status);

CREATE TABLE IF NOT EXISTS intents (
    id           UUID NOT NULL,
    position_id  UUID NOT NULL,
    intent_type  TEXT NOT NULL,
    intent_data  JSONB NOT NULL,
    status       TEXT NOT NULL,
    result       JSONB,
    error        TEXT,
    created_at   TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ,
    PRIMARY KEY (id, position_id)
);
CREATE INDEX IF NOT EXISTS idx_intents_status ON intents (status);
"#;

/// Store backed by PostgreSQL.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("Store schema migrated");
        Ok(())
    }

    fn intent_status_str(status: IntentStatus) -> &'static str {
        match status {
            IntentStatus::Pending => "pending",
            IntentStatus::Processing => "processing",
            IntentStatus::Completed => "completed",
            IntentStatus::Failed => "failed",
        }
    }

    async fn upsert_snapshot_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        position: &Position,
    ) -> Result<(), StoreError> {
        let state_data = serde_json::to_value(position)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                id, account_id, symbol, side, state, entry_price,
                tech_stop_distance, tech_stop_distance_pct, quantity,
                realized_pnl, fees_paid, entry_order_id, exit_order_id,
                binance_position_id, state_data, created_at, updated_at, closed_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                entry_price = EXCLUDED.entry_price,
                tech_stop_distance_pct = EXCLUDED.tech_stop_distance_pct,
                quantity = EXCLUDED.quantity,
                realized_pnl = EXCLUDED.realized_pnl,
                fees_paid = EXCLUDED.fees_paid,
                entry_order_id = EXCLUDED.entry_order_id,
                exit_order_id = EXCLUDED.exit_order_id,
                binance_position_id = EXCLUDED.binance_position_id,
                state_data = EXCLUDED.state_data,
                updated_at = EXCLUDED.updated_at,
                closed_at = EXCLUDED.closed_at
            "#,
        )
        .bind(position.id)
        .bind(position.account_id)
        .bind(position.symbol.as_pair())
        .bind(position.side.to_string())
        .bind(position.state.name())
        .bind(position.entry_price.map(|p| p.as_decimal()))
        .bind(position.tech_stop_distance.distance())
        .bind(position.tech_stop_distance_pct)
        .bind(position.quantity.map(|q| q.as_decimal()))
        .bind(position.realized_pnl)
        .bind(position.fees_paid)
        .bind(position.entry_order_id.as_deref())
        .bind(position.exit_order_id.as_deref())
        .bind(position.exchange_position_id.as_deref())
        .bind(state_data)
        .bind(position.created_at)
        .bind(position.updated_at)
        .bind(position.closed_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    fn position_from_row(row: &sqlx::postgres::PgRow) -> Result<Position, StoreError> {
        let state_data: serde_json::Value = row.try_get("state_data")?;
        serde_json::from_value(state_data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

// =============================================================================
// Event repository
// =============================================================================

#[async_trait]
impl EventRepository for PgStore {
    async fn append(&self, event: &Event, snapshot: &Position) -> Result<i64, StoreError> {
        if event.position_id() != snapshot.id {
            return Err(StoreError::Serialization(format!(
                "event position {} != snapshot position {}",
                event.position_id(),
                snapshot.id
            )));
        }

        let event_data = serde_json::to_value(event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO events (position_id, event_type, event_data, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING seq
            "#,
        )
        .bind(event.position_id())
        .bind(event.event_type())
        .bind(event_data)
        .bind(event.timestamp())
        .fetch_one(&mut *tx)
        .await?;

        Self::upsert_snapshot_tx(&mut tx, snapshot).await?;

        tx.commit().await?;
        Ok(seq)
    }

    async fn events_for(&self, position_id: PositionId) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT event_data FROM events WHERE position_id = $1 ORDER BY seq",
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(data,)| {
                serde_json::from_value(data).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn events_after(
        &self,
        position_id: PositionId,
        after_seq: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT event_data FROM events WHERE position_id = $1 AND seq > $2 ORDER BY seq",
        )
        .bind(position_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(data,)| {
                serde_json::from_value(data).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn latest_seq(&self, position_id: PositionId) -> Result<Option<i64>, StoreError> {
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM events WHERE position_id = $1")
                .bind(position_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(seq)
    }
}

// =============================================================================
// Position repository
// =============================================================================

#[async_trait]
impl PositionRepository for PgStore {
    async fn load_snapshot(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query("SELECT state_data FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::position_from_row(&r)).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            "SELECT state_data FROM positions WHERE state IN ('armed','entering','active','exiting') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::position_from_row).collect()
    }

    async fn list_by_state(&self, state: &str) -> Result<Vec<Position>, StoreError> {
        let rows =
            sqlx::query("SELECT state_data FROM positions WHERE state = $1 ORDER BY created_at")
                .bind(state)
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(Self::position_from_row).collect()
    }

    async fn find_live_by_symbol_side(
        &self,
        symbol: &Symbol,
        side: Side,
    ) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT state_data FROM positions
            WHERE symbol = $1 AND side = $2
              AND state IN ('armed','entering','active','exiting')
            LIMIT 1
            "#,
        )
        .bind(symbol.as_pair())
        .bind(side.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::position_from_row(&r)).transpose()
    }

    async fn heal_snapshot(&self, position: &Position) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_snapshot_tx(&mut tx, position).await?;
        tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// Order repository
// =============================================================================

#[async_trait]
impl OrderRepository for PgStore {
    async fn save(&self, order: &Order) -> Result<(), StoreError> {
        let order_data = serde_json::to_value(order)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, position_id, exchange_order_id, client_order_id, symbol,
                side, order_type, quantity, price, stop_price, status,
                filled_quantity, fill_price, filled_at, fee_paid, order_data,
                created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            ON CONFLICT (id) DO UPDATE SET
                exchange_order_id = EXCLUDED.exchange_order_id,
                status = EXCLUDED.status,
                filled_quantity = EXCLUDED.filled_quantity,
                fill_price = EXCLUDED.fill_price,
                filled_at = EXCLUDED.filled_at,
                fee_paid = EXCLUDED.fee_paid,
                order_data = EXCLUDED.order_data
            "#,
        )
        .bind(order.id)
        .bind(order.position_id)
        .bind(order.exchange_order_id.as_deref())
        .bind(order.client_order_id.as_str())
        .bind(order.symbol.as_pair())
        .bind(order.side.to_string())
        .bind(format!("{:?}", order.order_type).to_lowercase())
        .bind(order.quantity.as_decimal())
        .bind(order.price.map(|p| p.as_decimal()))
        .bind(order.stop_price.map(|p| p.as_decimal()))
        .bind(format!("{:?}", order.status).to_lowercase())
        .bind(order.filled_quantity.map(|q| q.as_decimal()))
        .bind(order.fill_price.map(|p| p.as_decimal()))
        .bind(order.filled_at)
        .bind(order.fee_paid)
        .bind(order_data)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT order_data FROM orders WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(data,)| {
            serde_json::from_value(data).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn find_by_position(&self, position_id: PositionId) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT order_data FROM orders WHERE position_id = $1 ORDER BY created_at",
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(data,)| {
                serde_json::from_value(data).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Order>, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT order_data FROM orders WHERE client_order_id = $1 LIMIT 1")
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(data,)| {
            serde_json::from_value(data).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }
}

// =============================================================================
// Intent repository
// =============================================================================

#[async_trait]
impl IntentRepository for PgStore {
    async fn record(&self, intent: &Intent) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO intents (
                id, position_id, intent_type, intent_data, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(intent.id)
        .bind(intent.position_id)
        .bind(format!("{:?}", intent.kind).to_lowercase())
        .bind(&intent.payload)
        .bind(Self::intent_status_str(intent.status))
        .bind(intent.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().map(|c| c == "23505").unwrap_or(false) =>
            {
                Err(StoreError::duplicate("intent", intent.id.to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn find(
        &self,
        id: IntentId,
        position_id: PositionId,
    ) -> Result<Option<Intent>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM intents WHERE id = $1 AND position_id = $2",
        )
        .bind(id)
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| intent_from_row(&r)).transpose()
    }

    async fn mark(
        &self,
        id: IntentId,
        position_id: PositionId,
        status: IntentStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let completed = matches!(status, IntentStatus::Completed | IntentStatus::Failed);

        let updated = sqlx::query(
            r#"
            UPDATE intents
            SET status = $3,
                result = COALESCE($4, result),
                error = COALESCE($5, error),
                completed_at = CASE WHEN $6 THEN now() ELSE completed_at END
            WHERE id = $1 AND position_id = $2
            "#,
        )
        .bind(id)
        .bind(position_id)
        .bind(Self::intent_status_str(status))
        .bind(result)
        .bind(error)
        .bind(completed)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("intent", id.to_string()));
        }
        Ok(())
    }

    async fn unresolved(&self) -> Result<Vec<Intent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM intents WHERE status IN ('pending','processing') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(intent_from_row).collect()
    }

    async fn by_position(&self, position_id: PositionId) -> Result<Vec<Intent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM intents WHERE position_id = $1 ORDER BY id")
            .bind(position_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(intent_from_row).collect()
    }
}

fn intent_from_row(row: &sqlx::postgres::PgRow) -> Result<Intent, StoreError> {
    let kind_str: String = row.try_get("intent_type")?;
    let kind = match kind_str.as_str() {
        "entermarket" => marlim_domain::IntentKind::EnterMarket,
        "exitmarket" => marlim_domain::IntentKind::ExitMarket,
        "placeinsurancestop" => marlim_domain::IntentKind::PlaceInsuranceStop,
        "cancelinsurancestop" => marlim_domain::IntentKind::CancelInsuranceStop,
        "safetyexit" => marlim_domain::IntentKind::SafetyExit,
        other => return Err(StoreError::Serialization(format!("unknown intent type {}", other))),
    };

    let status_str: String = row.try_get("status")?;
    let status = match status_str.as_str() {
        "pending" => IntentStatus::Pending,
        "processing" => IntentStatus::Processing,
        "completed" => IntentStatus::Completed,
        "failed" => IntentStatus::Failed,
        other => return Err(StoreError::Serialization(format!("unknown status {}", other))),
    };

    let id: Uuid = row.try_get("id")?;
    let position_id: Uuid = row.try_get("position_id")?;
    let payload: serde_json::Value = row.try_get("intent_data")?;
    let result: Option<serde_json::Value> = row.try_get("result")?;
    let error: Option<String> = row.try_get("error")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;

    Ok(Intent {
        id,
        position_id,
        kind,
        payload,
        status,
        result,
        error,
        created_at,
        completed_at,
    })
}

impl Store for PgStore {
    fn events(&self) -> &dyn EventRepository {
        self
    }

    fn positions(&self) -> &dyn PositionRepository {
        self
    }

    fn orders(&self) -> &dyn OrderRepository {
        self
    }

    fn intents(&self) -> &dyn IntentRepository {
        self
    }
}
