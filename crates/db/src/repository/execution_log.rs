//! Append-only node execution log.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    models::{LogAction, NewLogEntry, NodeExecutionLogRow},
    DbError,
};

/// Append one audit row.
pub async fn append(
    conn: &mut PgConnection,
    enrollment_id: Uuid,
    automation_id: Uuid,
    node_id: &str,
    action: LogAction,
    detail: Option<&str>,
    created_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO node_execution_log
            (id, enrollment_id, automation_id, node_id, action, detail, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(enrollment_id)
    .bind(automation_id)
    .bind(node_id)
    .bind(action.as_str())
    .bind(detail)
    .bind(created_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Append a batch of entries in order.
pub async fn append_all(
    conn: &mut PgConnection,
    enrollment_id: Uuid,
    automation_id: Uuid,
    entries: &[NewLogEntry],
) -> Result<(), DbError> {
    for entry in entries {
        append(
            &mut *conn,
            enrollment_id,
            automation_id,
            &entry.node_id,
            entry.action,
            entry.detail.as_deref(),
            entry.created_at,
        )
        .await?;
    }
    Ok(())
}

/// The execution log of one enrollment, in append order.
pub async fn for_enrollment(
    pool: &PgPool,
    enrollment_id: Uuid,
) -> Result<Vec<NodeExecutionLogRow>, DbError> {
    let rows = sqlx::query_as::<_, NodeExecutionLogRow>(
        r#"
        SELECT id, enrollment_id, automation_id, node_id, action, detail, created_at
        FROM node_execution_log
        WHERE enrollment_id = $1
        ORDER BY seq
        "#,
    )
    .bind(enrollment_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
