use crate::ClientResult;
use crate::queries::Queries;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Shared SQLite handle behind the pending queue and blob stores.
#[derive(Clone)]
pub struct ClientDatabase {
    pub pool: SqlitePool,
}

impl ClientDatabase {
    pub async fn new(database_url: &str) -> ClientResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!("DATABASE: Connected to {}", database_url);
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection that never expires,
    /// otherwise every pooled connection would see its own empty database.
    pub async fn in_memory() -> ClientResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> ClientResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn count_pending(&self) -> ClientResult<usize> {
        let row = sqlx::query(Queries::COUNT_PENDING)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = ClientDatabase::in_memory().await.unwrap();
        assert_eq!(db.count_pending().await.unwrap(), 0);

        let row = sqlx::query("SELECT COUNT(*) as count FROM attachment_blobs")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let blobs: i64 = row.try_get("count").unwrap();
        assert_eq!(blobs, 0);
    }
}
