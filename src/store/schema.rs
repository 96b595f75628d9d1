// Table layout: one row per minute, one row per sample referencing its minute by surrogate key.

use sqlx::SqlitePool;

/// Creates `minute_buckets` and `samples` (plus index) if not present.
pub(super) async fn init_bucket_tables(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS minute_buckets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bucket_start INTEGER NOT NULL UNIQUE,
            annotation TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            minute_id INTEGER NOT NULL REFERENCES minute_buckets(id) ON DELETE CASCADE,
            value INTEGER NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_samples_minute_timestamp ON samples(minute_id, timestamp)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
