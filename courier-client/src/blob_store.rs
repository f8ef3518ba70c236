use crate::database::ClientDatabase;
use crate::queries::Queries;
use crate::ClientResult;
use chrono::{DateTime, Utc};
use courier_core::models::BlobRecord;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

/// Raw attachment bytes keyed by the owning message's temporary id.
///
/// Saves and deletes for different keys are independent statements, so they
/// may run concurrently. Bytes survive restarts when the database is on disk.
#[derive(Clone)]
pub struct BlobStore {
    pool: SqlitePool,
}

impl BlobStore {
    pub fn new(db: &ClientDatabase) -> Self {
        Self {
            pool: db.pool.clone(),
        }
    }

    pub async fn save(&self, key: &str, bytes: &[u8], mime_type: &str) -> ClientResult<BlobRecord> {
        let record = BlobRecord {
            key: key.to_string(),
            bytes: bytes.to_vec(),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
            saved_at: Utc::now(),
        };

        sqlx::query(Queries::UPSERT_BLOB)
            .bind(&record.key)
            .bind(&record.bytes)
            .bind(record.size as i64)
            .bind(&record.mime_type)
            .bind(record.saved_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        tracing::debug!(
            "DATABASE: Saved blob {} ({} bytes, {})",
            key,
            record.size,
            record.mime_type
        );
        Ok(record)
    }

    /// A missing key is `None`, not an error.
    pub async fn get(&self, key: &str) -> ClientResult<Option<BlobRecord>> {
        let row = sqlx::query(Queries::GET_BLOB)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::parse_blob(&row)).transpose()
    }

    pub async fn delete(&self, key: &str) -> ClientResult<()> {
        let result = sqlx::query(Queries::DELETE_BLOB)
            .bind(key)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::debug!("DATABASE: Deleted blob {}", key);
        }
        Ok(())
    }

    pub async fn contains(&self, key: &str) -> ClientResult<bool> {
        let row = sqlx::query(Queries::BLOB_EXISTS)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }

    pub async fn keys(&self) -> ClientResult<Vec<String>> {
        let rows = sqlx::query(Queries::LIST_BLOB_KEYS)
            .fetch_all(&self.pool)
            .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(row.try_get("key")?);
        }
        Ok(keys)
    }

    fn parse_blob(row: &SqliteRow) -> ClientResult<BlobRecord> {
        let size: i64 = row.try_get("size")?;
        let saved_at: String = row.try_get("saved_at")?;
        let saved_at = DateTime::parse_from_rfc3339(&saved_at)
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(BlobRecord {
            key: row.try_get("key")?,
            bytes: row.try_get("bytes")?,
            size: size as u64,
            mime_type: row.try_get("mime_type")?,
            saved_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> BlobStore {
        let db = ClientDatabase::in_memory().await.unwrap();
        BlobStore::new(&db)
    }

    #[tokio::test]
    async fn test_get_missing_key_returns_none() {
        let store = store().await;
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(!store.contains("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_get_delete() {
        let store = store().await;
        let bytes = vec![7u8; 4096];

        let saved = store.save("t-1", &bytes, "audio/ogg").await.unwrap();
        assert_eq!(saved.size, 4096);

        let loaded = store.get("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.bytes, bytes);
        assert_eq!(loaded.mime_type, "audio/ogg");
        assert_eq!(loaded.size, 4096);

        store.delete("t-1").await.unwrap();
        store.delete("t-1").await.unwrap();
        assert!(store.get("t-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_existing_key() {
        let store = store().await;
        store.save("t-1", b"old", "audio/ogg").await.unwrap();
        store.save("t-1", b"newer", "audio/webm").await.unwrap();

        let loaded = store.get("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.bytes, b"newer".to_vec());
        assert_eq!(loaded.mime_type, "audio/webm");
        assert_eq!(store.keys().await.unwrap(), vec!["t-1".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_saves_for_different_keys() {
        let store = store().await;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let key = format!("t-{}", i);
                    store.save(&key, &[i as u8; 32], "application/pdf").await.unwrap();
                    if i % 2 == 0 {
                        store.delete(&key).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["t-1", "t-3", "t-5", "t-7"]);
    }
}
