//! Append-only webhook audit log.

use crate::error::RouterError;

use super::Database;

pub async fn insert(
    db: &Database,
    payload: &serde_json::Value,
    status: &str,
    message: Option<&str>,
) -> Result<(), RouterError> {
    sqlx::query(
        r#"
        INSERT INTO webhook_logs_tb (payload, status, message)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(payload)
    .bind(status)
    .bind(message)
    .execute(db.pool())
    .await?;
    Ok(())
}
