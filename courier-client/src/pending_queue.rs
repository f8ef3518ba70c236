use crate::database::ClientDatabase;
use crate::queries::Queries;
use crate::ClientResult;
use chrono::Utc;
use courier_core::models::PendingMessage;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

/// Durable outgoing messages, organised as an ordered list per room.
///
/// Every write is an overwrite keyed by room and temporary id, so repeating a
/// call with the same arguments leaves the store unchanged.
#[derive(Clone)]
pub struct PendingQueueStore {
    pool: SqlitePool,
}

impl PendingQueueStore {
    pub fn new(db: &ClientDatabase) -> Self {
        Self {
            pool: db.pool.clone(),
        }
    }

    pub async fn list(&self, room_id: &str) -> ClientResult<Vec<PendingMessage>> {
        let rows = sqlx::query(Queries::LIST_ROOM)
            .bind(room_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> ClientResult<PendingMessage> {
                let record: String = row.try_get("record")?;
                Ok(serde_json::from_str(&record)?)
            })
            .collect()
    }

    /// Replace the room's list. An empty list removes the room.
    pub async fn save_all(&self, room_id: &str, records: &[PendingMessage]) -> ClientResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(Queries::DELETE_ROOM)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().to_rfc3339();
        for (position, record) in records.iter().enumerate() {
            let json = serde_json::to_string(record)?;
            sqlx::query(Queries::INSERT_PENDING)
                .bind(room_id)
                .bind(&record.temporary_id)
                .bind(position as i64)
                .bind(json)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            "DATABASE: Saved {} pending records for room {}",
            records.len(),
            room_id
        );
        Ok(())
    }

    /// Insert a record at the end of its room, or replace it in place.
    pub async fn upsert(&self, record: &PendingMessage) -> ClientResult<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(Queries::UPSERT_PENDING)
            .bind(&record.room_id)
            .bind(&record.temporary_id)
            .bind(json)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        tracing::debug!(
            "DATABASE: Upserted pending record {} (status={})",
            record.temporary_id,
            record.status
        );
        Ok(())
    }

    pub async fn get(&self, room_id: &str, temporary_id: &str) -> ClientResult<Option<PendingMessage>> {
        let row = sqlx::query(Queries::GET_PENDING)
            .bind(room_id)
            .bind(temporary_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let record: String = row.try_get("record")?;
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }

    /// Removing a record that is not there is a no-op.
    pub async fn remove(&self, room_id: &str, temporary_id: &str) -> ClientResult<()> {
        let result = sqlx::query(Queries::DELETE_PENDING)
            .bind(room_id)
            .bind(temporary_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::debug!("DATABASE: Removed pending record {} from room {}", temporary_id, room_id);
        }
        Ok(())
    }

    pub async fn clear_room(&self, room_id: &str) -> ClientResult<()> {
        sqlx::query(Queries::DELETE_ROOM)
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_all(&self) -> ClientResult<BTreeMap<String, Vec<PendingMessage>>> {
        let rows = sqlx::query(Queries::LIST_ALL)
            .fetch_all(&self.pool)
            .await?;

        let mut rooms: BTreeMap<String, Vec<PendingMessage>> = BTreeMap::new();
        for row in rows {
            let room_id: String = row.try_get("room_id")?;
            let record: String = row.try_get("record")?;
            rooms
                .entry(room_id)
                .or_default()
                .push(serde_json::from_str(&record)?);
        }
        Ok(rooms)
    }
}
