use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CorrelationContext, OutboxEvent, OutboxEventId, OutboxQuery, OutboxStatus, OutboxStoreError,
    Result, StatusUpdate, TopicRouter,
    store::{OutboxStateStore, Transactional},
};

const SELECT_COLUMNS: &str = "SELECT id, event_type, payload, destination, message_key, status, created_at, processed_at, correlation, last_error FROM outbox_events";

/// PostgreSQL-backed outbox store implementation.
///
/// `save` writes through the caller's `sqlx::Transaction`, so the host
/// application runs its own business statements on the same handle.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    router: TopicRouter,
}

impl PostgresOutboxStore {
    /// Creates a new PostgreSQL outbox store routing everything to the
    /// default topic.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            router: TopicRouter::default(),
        }
    }

    /// Creates a new PostgreSQL outbox store with the given topic router.
    pub fn with_router(pool: PgPool, router: TopicRouter) -> Self {
        Self { pool, router }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<OutboxEvent> {
        let status: String = row.try_get("status")?;
        let correlation_json: serde_json::Value = row.try_get("correlation")?;
        let correlation: CorrelationContext = serde_json::from_value(correlation_json)?;

        Ok(OutboxEvent {
            id: OutboxEventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            destination: row.try_get("destination")?,
            key: row.try_get("message_key")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            correlation,
            last_error: row.try_get("last_error")?,
        })
    }

    /// Moves a pending event to `to` in one statement, then explains a
    /// zero-row result by reading the current status.
    async fn apply_status(
        &self,
        id: OutboxEventId,
        to: OutboxStatus,
        reason: Option<&str>,
    ) -> Result<StatusUpdate> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $2, processed_at = NOW(), last_error = COALESCE($3, last_error)
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(StatusUpdate::Applied);
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        let current: OutboxStatus = current
            .ok_or(OutboxStoreError::EventNotFound(id))?
            .parse()?;

        current
            .transition(to)
            .map_err(|e| OutboxStoreError::InvalidTransition {
                event_id: id,
                from: e.from,
                to: e.to,
            })
    }
}

#[async_trait]
impl Transactional for PostgresOutboxStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStateStore for PostgresOutboxStore {
    async fn save(&self, tx: &mut Self::Tx, event: &OutboxEvent) -> Result<()> {
        let correlation_json = serde_json::to_value(&event.correlation)?;

        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, event_type, payload, destination, message_key, status, created_at, processed_at, correlation, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.destination)
        .bind(&event.key)
        .bind(event.status.as_str())
        .bind(event.created_at)
        .bind(event.processed_at)
        .bind(correlation_json)
        .bind(&event.last_error)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return OutboxStoreError::DuplicateEvent(event.id);
            }
            OutboxStoreError::Database(e)
        })?;

        Ok(())
    }

    async fn mark_processed(&self, id: OutboxEventId) -> Result<StatusUpdate> {
        self.apply_status(id, OutboxStatus::Processed, None).await
    }

    async fn mark_failed(&self, id: OutboxEventId, reason: &str) -> Result<StatusUpdate> {
        self.apply_status(id, OutboxStatus::Failed, Some(reason))
            .await
    }

    fn resolve_topic(&self, event: &OutboxEvent) -> String {
        self.router.resolve(event)
    }

    async fn get_event(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>> {
        let row: Option<PgRow> = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_event).transpose()
    }

    async fn query_events(&self, query: OutboxQuery) -> Result<Vec<OutboxEvent>> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        if query.event_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ${param_count}"));
        }
        if query.created_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at < ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(status) = query.status {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(event_type) = query.event_type {
            sqlx_query = sqlx_query.bind(event_type);
        }
        if let Some(cutoff) = query.created_before {
            sqlx_query = sqlx_query.bind(cutoff);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }
}
