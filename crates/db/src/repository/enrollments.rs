//! Enrollment ledger (`contact_automations`) operations.
//!
//! Schedulers poll this table and use `SELECT … FOR UPDATE SKIP LOCKED`
//! when claiming, then stamp a lease so the row stays theirs while the node
//! runs outside the transaction.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    models::{ContactAutomationRow, EnrollmentCounts},
    repository::{execution_log, trigger_log},
    store::{EnrollOutcome, EnrollmentUpdate, Lease, NewEnrollment},
    DbError,
};

const COLUMNS: &str = "id, workspace_id, automation_id, contact_email, status, current_node_id, \
                       scheduled_at, entered_at, context, retry_count, max_retries, \
                       locked_by, locked_until, updated_at";

/// Insert the enrollment (and its opening log rows) in one transaction,
/// gated on the trigger log when `new.dedup` is set.
pub async fn enroll(pool: &PgPool, new: NewEnrollment) -> Result<EnrollOutcome, DbError> {
    let mut tx = pool.begin().await?;
    let row = &new.row;

    if new.dedup
        && !trigger_log::try_insert(&mut *tx, row.automation_id, &row.contact_email, row.entered_at)
            .await?
    {
        tx.rollback().await?;
        return Ok(EnrollOutcome::Duplicate);
    }

    insert(&mut *tx, row).await?;
    execution_log::append_all(&mut *tx, row.id, row.automation_id, &new.logs).await?;

    tx.commit().await?;
    Ok(EnrollOutcome::Enrolled(new.row))
}

async fn insert(conn: &mut PgConnection, row: &ContactAutomationRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO contact_automations
            (id, workspace_id, automation_id, contact_email, status, current_node_id,
             scheduled_at, entered_at, context, retry_count, max_retries,
             locked_by, locked_until, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(row.id)
    .bind(&row.workspace_id)
    .bind(row.automation_id)
    .bind(&row.contact_email)
    .bind(&row.status)
    .bind(&row.current_node_id)
    .bind(row.scheduled_at)
    .bind(row.entered_at)
    .bind(&row.context)
    .bind(row.retry_count)
    .bind(row.max_retries)
    .bind(&row.locked_by)
    .bind(row.locked_until)
    .bind(row.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// The due set without taking any lock.
pub async fn due(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ContactAutomationRow>, DbError> {
    let sql = format!(
        "SELECT {cols} FROM contact_automations ca \
         WHERE ca.status = 'active' AND ca.scheduled_at <= $1 \
           AND EXISTS (SELECT 1 FROM automations a \
                       WHERE a.id = ca.automation_id \
                         AND a.status = 'live' AND a.deleted_at IS NULL) \
         ORDER BY ca.scheduled_at, ca.entered_at, ca.id \
         LIMIT $2",
        cols = prefixed("ca")
    );
    let rows = sqlx::query_as::<_, ContactAutomationRow>(&sql)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Atomically claim up to `limit` due rows and stamp them with `lease`.
///
/// Rows locked by a concurrent claimer are skipped, not waited on.
pub async fn claim_due(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
    lease: &Lease,
) -> Result<Vec<ContactAutomationRow>, DbError> {
    let sql = format!(
        "WITH due AS ( \
             SELECT ca.id FROM contact_automations ca \
             JOIN automations a ON a.id = ca.automation_id \
             WHERE ca.status = 'active' AND ca.scheduled_at <= $1 \
               AND (ca.locked_until IS NULL OR ca.locked_until <= $1) \
               AND a.status = 'live' AND a.deleted_at IS NULL \
             ORDER BY ca.scheduled_at, ca.entered_at, ca.id \
             LIMIT $2 \
             FOR UPDATE OF ca SKIP LOCKED \
         ) \
         UPDATE contact_automations ca \
         SET locked_by = $3, locked_until = $4 \
         FROM due WHERE ca.id = due.id \
         RETURNING {cols}",
        cols = prefixed("ca")
    );

    let mut rows = sqlx::query_as::<_, ContactAutomationRow>(&sql)
        .bind(now)
        .bind(limit)
        .bind(&lease.owner)
        .bind(lease.until)
        .fetch_all(pool)
        .await?;

    rows.sort_by_key(|r| (r.scheduled_at, r.entered_at, r.id));
    Ok(rows)
}

/// Extend a lease still held by `lease.owner` on an active row of a live
/// automation.
pub async fn renew_lease(pool: &PgPool, id: Uuid, lease: &Lease) -> Result<bool, DbError> {
    let renewed: Option<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE contact_automations ca
        SET locked_until = $3
        FROM automations a
        WHERE ca.id = $1 AND ca.locked_by = $2 AND ca.status = 'active'
          AND a.id = ca.automation_id AND a.status = 'live' AND a.deleted_at IS NULL
        RETURNING ca.id
        "#,
    )
    .bind(id)
    .bind(&lease.owner)
    .bind(lease.until)
    .fetch_optional(pool)
    .await?;

    Ok(renewed.is_some())
}

/// Write a step outcome and its log rows, releasing the lease.
///
/// Returns `false` when the row is no longer active or no longer ours.
pub async fn save_step(pool: &PgPool, update: &EnrollmentUpdate) -> Result<bool, DbError> {
    let mut tx = pool.begin().await?;

    let automation_id: Option<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE contact_automations
        SET status = $3, current_node_id = $4, scheduled_at = $5, retry_count = $6,
            locked_by = NULL, locked_until = NULL, updated_at = $7
        WHERE id = $1 AND locked_by = $2 AND status = 'active'
        RETURNING automation_id
        "#,
    )
    .bind(update.id)
    .bind(&update.lease_owner)
    .bind(update.status.as_str())
    .bind(&update.current_node_id)
    .bind(update.scheduled_at)
    .bind(update.retry_count)
    .bind(update.now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(automation_id) = automation_id else {
        tx.rollback().await?;
        return Ok(false);
    };

    execution_log::append_all(&mut *tx, update.id, automation_id, &update.logs).await?;
    tx.commit().await?;
    Ok(true)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<ContactAutomationRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM contact_automations WHERE id = $1");
    sqlx::query_as::<_, ContactAutomationRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Enrollments of an automation in entry order, optionally for one contact.
pub async fn list(
    pool: &PgPool,
    automation_id: Uuid,
    contact_email: Option<&str>,
) -> Result<Vec<ContactAutomationRow>, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM contact_automations \
         WHERE automation_id = $1 AND ($2::text IS NULL OR contact_email = $2) \
         ORDER BY entered_at, id"
    );
    let rows = sqlx::query_as::<_, ContactAutomationRow>(&sql)
        .bind(automation_id)
        .bind(contact_email)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Per-status counters computed by aggregation.
pub async fn counts(pool: &PgPool, automation_id: Uuid) -> Result<EnrollmentCounts, DbError> {
    let mut conn = pool.acquire().await?;

    let (enrolled, active, completed, exited): (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COUNT(*) FILTER (WHERE status = 'active'),
               COUNT(*) FILTER (WHERE status = 'completed'),
               COUNT(*) FILTER (WHERE status = 'exited')
        FROM contact_automations
        WHERE automation_id = $1
        "#,
    )
    .bind(automation_id)
    .fetch_one(&mut *conn)
    .await?;

    let triggered_contacts = trigger_log::count_for_automation(&mut *conn, automation_id).await?;

    Ok(EnrollmentCounts { enrolled, active, completed, exited, triggered_contacts })
}

fn prefixed(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|col| format!("{alias}.{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
