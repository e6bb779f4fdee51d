//! PostgreSQL implementation of FlowStore
//!
//! Every conditional write runs inside a transaction and reports the rows it
//! actually changed; a zero count means another process got there first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::model::{
    Context, ContextStatus, RetryTicket, StreamId, TicketEntityType, Trace, TraceStatus,
    TransCompletion,
};

const CONTEXT_COLUMNS: &str = "id, graph_id, version, trans_id, position, inbound_event, status, \
     trace_ids, batch_key, payload, error, created_at, updated_at";

const TRACE_SELECT: &str = r#"
    SELECT t.id, t.trans_id, t.graph_id, t.version, t.status, t.started_at, t.ended_at,
           t.started_by,
           ARRAY(SELECT c.id FROM flow_contexts c WHERE t.id = ANY(c.trace_ids)) AS context_ids
    FROM flow_traces t
"#;

const TICKET_COLUMNS: &str = "entity_id, entity_type, graph_id, node_id, last_retry_at, \
     next_retry_at, retry_count, context_ids, created_at";

/// PostgreSQL implementation of [`FlowStore`]
///
/// # Example
///
/// ```ignore
/// use flowmesh_engine::persistence::PostgresFlowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowmesh").await?;
/// let store = PostgresFlowStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresFlowStore {
    pool: PgPool,
}

impl PostgresFlowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Lock `ids` and check they all exist with status `expected`
    async fn lock_in_status(
        tx: &mut Transaction<'static, Postgres>,
        ids: &[Uuid],
        expected: ContextStatus,
    ) -> Result<bool, StoreError> {
        let rows = sqlx::query("SELECT status FROM flow_contexts WHERE id = ANY($1) FOR UPDATE")
            .bind(ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.len() == ids.len()
            && rows
                .iter()
                .all(|row| row.get::<String, _>("status") == expected.as_str()))
    }

    async fn insert_in(
        tx: &mut Transaction<'static, Postgres>,
        contexts: &[Context],
    ) -> Result<(), StoreError> {
        for ctx in contexts {
            let payload = serde_json::to_value(&ctx.payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let error = error_json(ctx)?;
            let trace_ids: Vec<Uuid> = ctx.trace_ids.iter().copied().collect();

            sqlx::query(
                r#"
                INSERT INTO flow_contexts
                    (id, graph_id, version, trans_id, position, inbound_event, status,
                     trace_ids, batch_key, payload, error, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(ctx.id)
            .bind(ctx.stream.graph_id)
            .bind(ctx.stream.version as i32)
            .bind(ctx.trans_id)
            .bind(&ctx.position)
            .bind(&ctx.inbound_event)
            .bind(ctx.status.as_str())
            .bind(&trace_ids)
            .bind(&ctx.batch_key)
            .bind(&payload)
            .bind(&error)
            .bind(ctx.created_at)
            .bind(ctx.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!("Failed to insert context: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }
        Ok(())
    }

    async fn replace_in(
        tx: &mut Transaction<'static, Postgres>,
        contexts: &[Context],
    ) -> Result<u64, StoreError> {
        let mut changed = 0;
        for ctx in contexts {
            let payload = serde_json::to_value(&ctx.payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let error = error_json(ctx)?;
            let trace_ids: Vec<Uuid> = ctx.trace_ids.iter().copied().collect();

            let result = sqlx::query(
                r#"
                UPDATE flow_contexts
                SET position = $2, inbound_event = $3, status = $4, trace_ids = $5,
                    batch_key = $6, payload = $7, error = $8, updated_at = $9
                WHERE id = $1
                "#,
            )
            .bind(ctx.id)
            .bind(&ctx.position)
            .bind(&ctx.inbound_event)
            .bind(ctx.status.as_str())
            .bind(&trace_ids)
            .bind(&ctx.batch_key)
            .bind(&payload)
            .bind(&error)
            .bind(ctx.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            changed += result.rows_affected();
        }
        Ok(changed)
    }
}

#[async_trait]
impl ContextStore for PostgresFlowStore {
    #[instrument(skip(self, contexts), fields(count = contexts.len()))]
    async fn insert_contexts(&self, contexts: &[Context]) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        Self::insert_in(&mut tx, contexts).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn get_context(&self, id: Uuid) -> Result<Option<Context>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONTEXT_COLUMNS} FROM flow_contexts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(context_from_row).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_contexts(&self, ids: &[Uuid]) -> Result<Vec<Context>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTEXT_COLUMNS} FROM flow_contexts WHERE id = ANY($1) ORDER BY id"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(context_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn contexts_by_trace(&self, trace_id: Uuid) -> Result<Vec<Context>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTEXT_COLUMNS} FROM flow_contexts WHERE $1 = ANY(trace_ids) ORDER BY id"
        ))
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(context_from_row).collect()
    }

    #[instrument(skip(self, contexts), fields(count = contexts.len()))]
    async fn update_contexts(
        &self,
        contexts: &[Context],
        expected: ContextStatus,
    ) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = contexts.iter().map(|c| c.id).collect();
        let mut tx = self.begin().await?;

        if !Self::lock_in_status(&mut tx, &ids, expected).await? {
            debug!(%expected, "contexts moved, update skipped");
            return Ok(0);
        }
        let changed = Self::replace_in(&mut tx, contexts).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(changed)
    }

    #[instrument(skip(self, ids, from), fields(count = ids.len()))]
    async fn update_status_if(
        &self,
        ids: &[Uuid],
        from: &[ContextStatus],
        to: ContextStatus,
    ) -> Result<u64, StoreError> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE flow_contexts
            SET status = $3,
                batch_key = CASE WHEN $3 = 'retryable' THEN batch_key ELSE NULL END,
                updated_at = NOW()
            WHERE id = ANY($1) AND status = ANY($2)
            "#,
        )
        .bind(ids)
        .bind(&from)
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update context status: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TraceStore for PostgresFlowStore {
    #[instrument(skip(self))]
    async fn get_trace(&self, id: Uuid) -> Result<Option<Trace>, StoreError> {
        let row = sqlx::query(&format!("{TRACE_SELECT} WHERE t.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(trace_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn traces_of_trans(&self, trans_id: Uuid) -> Result<Vec<Trace>, StoreError> {
        let rows = sqlx::query(&format!("{TRACE_SELECT} WHERE t.trans_id = $1 ORDER BY t.id"))
            .bind(trans_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(trace_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn running_traces(&self, limit: usize) -> Result<Vec<Trace>, StoreError> {
        let rows = sqlx::query(&format!(
            "{TRACE_SELECT} WHERE t.status = 'running' ORDER BY t.started_at LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(trace_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn finish_trace(&self, id: Uuid, status: TraceStatus) -> Result<u64, StoreError> {
        if !status.is_terminal() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE flow_traces
            SET status = $2, ended_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to finish trace: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, completion), fields(trans_id = %completion.trans_id))]
    async fn record_trans_completion(
        &self,
        completion: &TransCompletion,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO flow_trans_completions (trans_id, status, completed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (trans_id) DO NOTHING
            "#,
        )
        .bind(completion.trans_id)
        .bind(completion.status.as_str())
        .bind(completion.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn get_trans_completion(
        &self,
        trans_id: Uuid,
    ) -> Result<Option<TransCompletion>, StoreError> {
        let row = sqlx::query(
            "SELECT trans_id, status, completed_at FROM flow_trans_completions WHERE trans_id = $1",
        )
        .bind(trans_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.map(|row| {
            Ok(TransCompletion {
                trans_id: row.get("trans_id"),
                status: parse_trace_status(&row.get::<String, _>("status"))?,
                completed_at: row.get("completed_at"),
            })
        })
        .transpose()
    }
}

#[async_trait]
impl RetryTicketStore for PostgresFlowStore {
    #[instrument(skip(self))]
    async fn get_ticket(&self, batch_key: &str) -> Result<Option<RetryTicket>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM flow_retry_tickets WHERE entity_id = $1"
        ))
        .bind(batch_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(ticket_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn due_tickets(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryTicket>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM flow_retry_tickets \
             WHERE next_retry_at <= $1 ORDER BY next_retry_at LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(ticket_from_row).collect()
    }

    async fn has_due_tickets(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM flow_retry_tickets WHERE next_retry_at <= $1) AS due",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get("due"))
    }

    #[instrument(skip(self))]
    async fn delete_ticket(&self, batch_key: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM flow_retry_tickets WHERE entity_id = $1")
            .bind(batch_key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FlowStore for PostgresFlowStore {
    #[instrument(skip(self, traces, contexts), fields(traces = traces.len()))]
    async fn create_run(&self, traces: &[Trace], contexts: &[Context]) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        for trace in traces {
            sqlx::query(
                r#"
                INSERT INTO flow_traces
                    (id, trans_id, graph_id, version, status, started_at, started_by)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(trace.id)
            .bind(trace.trans_id)
            .bind(trace.stream.graph_id)
            .bind(trace.stream.version as i32)
            .bind(trace.status.as_str())
            .bind(trace.started_at)
            .bind(&trace.started_by)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to create trace: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }
        Self::insert_in(&mut tx, contexts).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(traces = traces.len(), contexts = contexts.len(), "created run");
        Ok(())
    }

    #[instrument(skip(self, finished, successors), fields(context_id = %finished.id))]
    async fn advance(
        &self,
        finished: &Context,
        expected: ContextStatus,
        successors: &[Context],
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;

        if !Self::lock_in_status(&mut tx, &[finished.id], expected).await? {
            debug!(%expected, "context moved, advance skipped");
            return Ok(0);
        }
        Self::replace_in(&mut tx, std::slice::from_ref(finished)).await?;
        Self::insert_in(&mut tx, successors).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(1)
    }

    #[instrument(skip(self, contexts, ticket), fields(batch_key = %ticket.entity_id))]
    async fn park_retryable(
        &self,
        contexts: &[Context],
        expected: ContextStatus,
        ticket: &RetryTicket,
    ) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = contexts.iter().map(|c| c.id).collect();
        let mut tx = self.begin().await?;

        if !Self::lock_in_status(&mut tx, &ids, expected).await? {
            return Ok(0);
        }
        let changed = Self::replace_in(&mut tx, contexts).await?;

        let ticket_ids: Vec<Uuid> = ticket.context_ids.iter().copied().collect();
        sqlx::query(
            r#"
            INSERT INTO flow_retry_tickets
                (entity_id, entity_type, graph_id, node_id, last_retry_at, next_retry_at,
                 retry_count, context_ids, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (entity_id) DO UPDATE
            SET context_ids = ARRAY(
                SELECT DISTINCT unnest(flow_retry_tickets.context_ids || EXCLUDED.context_ids)
            )
            "#,
        )
        .bind(&ticket.entity_id)
        .bind(ticket.entity_type.as_str())
        .bind(ticket.graph_id)
        .bind(&ticket.node_id)
        .bind(ticket.last_retry_at)
        .bind(ticket.next_retry_at)
        .bind(ticket.retry_count as i32)
        .bind(&ticket_ids)
        .bind(ticket.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to upsert retry ticket: {}", e);
            StoreError::Database(e.to_string())
        })?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(count = changed, "parked retryable contexts");
        Ok(changed)
    }

    #[instrument(skip(self, claim), fields(batch_key = %claim.batch_key))]
    async fn claim_retry_batch(&self, claim: &BatchClaim) -> Result<u64, StoreError> {
        if claim.context_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.begin().await?;

        let advanced = sqlx::query(
            r#"
            UPDATE flow_retry_tickets
            SET retry_count = retry_count + 1, last_retry_at = $3, next_retry_at = $4
            WHERE entity_id = $1 AND retry_count = $2
            "#,
        )
        .bind(&claim.batch_key)
        .bind(claim.expected_retry_count as i32)
        .bind(claim.retried_at)
        .bind(claim.next_retry_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if advanced.rows_affected() == 0 {
            debug!("retry ticket already advanced");
            return Ok(0);
        }

        let flipped = sqlx::query(
            r#"
            UPDATE flow_contexts
            SET status = 'ready', batch_key = NULL, updated_at = $3
            WHERE id = ANY($1) AND status = 'retryable' AND batch_key = $2
            "#,
        )
        .bind(&claim.context_ids)
        .bind(&claim.batch_key)
        .bind(claim.retried_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if flipped.rows_affected() != claim.context_ids.len() as u64 {
            // Dropping the transaction rolls back the ticket update
            debug!(
                expected = claim.context_ids.len(),
                actual = flipped.rows_affected(),
                "retry batch changed under claim"
            );
            return Ok(0);
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(1)
    }

    #[instrument(skip(self))]
    async fn delete_run(&self, trace_id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;

        let deleted = sqlx::query("DELETE FROM flow_traces WHERE id = $1")
            .bind(trace_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if deleted.rows_affected() == 0 {
            return Ok(0);
        }

        sqlx::query(
            r#"
            UPDATE flow_contexts
            SET trace_ids = array_remove(trace_ids, $1)
            WHERE $1 = ANY(trace_ids)
            "#,
        )
        .bind(trace_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let removed: Vec<Uuid> =
            sqlx::query("DELETE FROM flow_contexts WHERE cardinality(trace_ids) = 0 RETURNING id")
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?
                .iter()
                .map(|row| row.get("id"))
                .collect();

        sqlx::query("DELETE FROM flow_retry_tickets WHERE context_ids <@ $1")
            .bind(&removed)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%trace_id, contexts = removed.len(), "deleted run");
        Ok(1)
    }
}

fn error_json(ctx: &Context) -> Result<Option<serde_json::Value>, StoreError> {
    ctx.error
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn context_from_row(row: &PgRow) -> Result<Context, StoreError> {
    let status: String = row.get("status");
    let status = ContextStatus::parse(&status)
        .ok_or_else(|| StoreError::Database(format!("unknown context status: {status}")))?;
    let trace_ids: Vec<Uuid> = row.get("trace_ids");
    let payload = serde_json::from_value(row.get("payload"))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let error = row
        .get::<Option<serde_json::Value>, _>("error")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Context {
        id: row.get("id"),
        stream: StreamId::new(row.get("graph_id"), row.get::<i32, _>("version") as u32),
        trans_id: row.get("trans_id"),
        position: row.get("position"),
        inbound_event: row.get("inbound_event"),
        status,
        trace_ids: trace_ids.into_iter().collect(),
        batch_key: row.get("batch_key"),
        payload,
        error,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn trace_from_row(row: &PgRow) -> Result<Trace, StoreError> {
    let context_ids: Vec<Uuid> = row.get("context_ids");
    Ok(Trace {
        id: row.get("id"),
        trans_id: row.get("trans_id"),
        stream: StreamId::new(row.get("graph_id"), row.get::<i32, _>("version") as u32),
        status: parse_trace_status(&row.get::<String, _>("status"))?,
        context_ids: context_ids.into_iter().collect(),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        started_by: row.get("started_by"),
    })
}

fn ticket_from_row(row: &PgRow) -> Result<RetryTicket, StoreError> {
    let entity_type: String = row.get("entity_type");
    let context_ids: Vec<Uuid> = row.get("context_ids");
    Ok(RetryTicket {
        entity_id: row.get("entity_id"),
        entity_type: TicketEntityType::parse(&entity_type)
            .ok_or_else(|| StoreError::Database(format!("unknown entity type: {entity_type}")))?,
        graph_id: row.get("graph_id"),
        node_id: row.get("node_id"),
        last_retry_at: row.get("last_retry_at"),
        next_retry_at: row.get("next_retry_at"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        context_ids: context_ids.into_iter().collect(),
        created_at: row.get("created_at"),
    })
}

fn parse_trace_status(status: &str) -> Result<TraceStatus, StoreError> {
    TraceStatus::parse(status)
        .ok_or_else(|| StoreError::Database(format!("unknown trace status: {status}")))
}
