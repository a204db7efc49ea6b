// store/migrations.rs - Triple log schema migrations

use sqlx::SqlitePool;

use crate::Result;

/// Run all migrations
///
/// Migrations are idempotent and safe to run multiple times.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    run_if_needed(pool, 1, "create_triples_table").await?;
    run_if_needed(pool, 2, "create_transactions_table").await?;
    run_if_needed(pool, 3, "create_metadata_table").await?;
    run_if_needed(pool, 4, "create_indices").await?;

    Ok(())
}

/// Check if migration is needed and run the appropriate SQL
async fn run_if_needed(pool: &SqlitePool, id: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("Running migration {}: {}", id, name);

        match id {
            1 => create_triples_table(pool).await?,
            2 => create_transactions_table(pool).await?,
            3 => create_metadata_table(pool).await?,
            4 => create_indices(pool).await?,
            _ => return Err(crate::Error::Config(format!("Unknown migration id: {}", id))),
        }

        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;

        tracing::info!("Migration {} completed", id);
    }

    Ok(())
}

/// Migration 1: the append-only triple log
async fn create_triples_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE triples (
            entity_id TEXT NOT NULL,
            attribute TEXT NOT NULL,
            value TEXT NOT NULL,
            tx_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            retracted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entity_id, attribute, value, tx_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 2: transaction records
async fn create_transactions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE transactions (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('pending', 'committed', 'failed', 'synced')),
            synced INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 3: key-value metadata (session token, user snapshot)
async fn create_metadata_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 4: secondary indices for the query paths
async fn create_indices(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE INDEX idx_triples_entity ON triples(entity_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_triples_attribute ON triples(attribute)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_triples_tx ON triples(tx_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_triples_created ON triples(created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_transactions_timestamp ON transactions(timestamp)")
        .execute(pool)
        .await?;

    Ok(())
}
