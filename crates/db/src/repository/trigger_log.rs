//! Dedup gate for `once` automations.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::DbError;

/// Try to record that the automation fired for this contact.
///
/// Returns `false` when the key already exists. The primary key resolves
/// concurrent inserts; the loser sees zero affected rows, not an error.
pub async fn try_insert(
    conn: &mut PgConnection,
    automation_id: Uuid,
    contact_email: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        INSERT INTO automation_trigger_log (automation_id, contact_email, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (automation_id, contact_email) DO NOTHING
        "#,
    )
    .bind(automation_id)
    .bind(contact_email)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Distinct contacts the automation has fired for.
pub async fn count_for_automation(
    conn: &mut PgConnection,
    automation_id: Uuid,
) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM automation_trigger_log WHERE automation_id = $1",
    )
    .bind(automation_id)
    .fetch_one(conn)
    .await?;
    Ok(count)
}
