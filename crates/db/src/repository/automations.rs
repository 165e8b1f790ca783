//! Automation definition operations.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    models::{AutomationRow, AutomationStatus, LogAction},
    repository::execution_log,
    DbError,
};

const COLUMNS: &str = "id, workspace_id, name, status, event_kind, frequency, definition, \
                       created_at, updated_at, deleted_at";

/// Insert a new automation row.
pub async fn insert_automation(pool: &PgPool, row: &AutomationRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO automations
            (id, workspace_id, name, status, event_kind, frequency, definition,
             created_at, updated_at, deleted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(row.id)
    .bind(&row.workspace_id)
    .bind(&row.name)
    .bind(&row.status)
    .bind(&row.event_kind)
    .bind(&row.frequency)
    .bind(&row.definition)
    .bind(row.created_at)
    .bind(row.updated_at)
    .bind(row.deleted_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Overwrite the mutable columns of a non-deleted automation.
///
/// Returns `DbError::NotFound` if no live row matched.
pub async fn update_automation(pool: &PgPool, row: &AutomationRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE automations
        SET name = $2, status = $3, event_kind = $4, frequency = $5,
            definition = $6, updated_at = $7
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(row.id)
    .bind(&row.name)
    .bind(&row.status)
    .bind(&row.event_kind)
    .bind(&row.frequency)
    .bind(&row.definition)
    .bind(row.updated_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Fetch a single automation by its primary key, archived rows included.
pub async fn get_automation(pool: &PgPool, id: Uuid) -> Result<AutomationRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM automations WHERE id = $1");
    sqlx::query_as::<_, AutomationRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Return the workspace's non-deleted automations (newest first).
pub async fn list_automations(
    pool: &PgPool,
    workspace_id: &str,
) -> Result<Vec<AutomationRow>, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM automations \
         WHERE workspace_id = $1 AND deleted_at IS NULL \
         ORDER BY created_at DESC"
    );
    let rows = sqlx::query_as::<_, AutomationRow>(&sql)
        .bind(workspace_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Live automations of a workspace subscribed to `event_kind`.
pub async fn live_automations_for_event(
    pool: &PgPool,
    workspace_id: &str,
    event_kind: &str,
) -> Result<Vec<AutomationRow>, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM automations \
         WHERE workspace_id = $1 AND event_kind = $2 \
           AND status = 'live' AND deleted_at IS NULL \
         ORDER BY created_at, id"
    );
    let rows = sqlx::query_as::<_, AutomationRow>(&sql)
        .bind(workspace_id)
        .bind(event_kind)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn set_automation_status(
    pool: &PgPool,
    id: Uuid,
    status: AutomationStatus,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE automations SET status = $2, updated_at = $3 WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(status.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Soft-delete the automation and exit all of its active enrollments in a
/// single transaction. Returns the number of enrollments exited.
pub async fn archive_automation(
    pool: &PgPool,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let mut tx = pool.begin().await?;

    let archived = sqlx::query(
        r#"
        UPDATE automations
        SET status = 'archived', deleted_at = $2, updated_at = $2
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if archived.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(DbError::NotFound);
    }

    let exited: Vec<(Uuid, Option<String>)> = sqlx::query_as(
        r#"
        UPDATE contact_automations
        SET status = 'exited', scheduled_at = NULL,
            locked_by = NULL, locked_until = NULL, updated_at = $2
        WHERE automation_id = $1 AND status = 'active'
        RETURNING id, current_node_id
        "#,
    )
    .bind(id)
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    for (enrollment_id, node_id) in &exited {
        execution_log::append(
            &mut *tx,
            *enrollment_id,
            id,
            node_id.as_deref().unwrap_or_default(),
            LogAction::Exited,
            Some("automation deleted"),
            now,
        )
        .await?;
    }

    tx.commit().await?;
    Ok(exited.len() as u64)
}
