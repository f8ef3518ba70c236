/// SQL queries for the delivery store
pub struct Queries;

impl Queries {
    // Pending queue queries
    pub const LIST_ROOM: &'static str = r#"
        SELECT record FROM pending_messages
        WHERE room_id = ?1
        ORDER BY position ASC
    "#;

    pub const LIST_ALL: &'static str = r#"
        SELECT room_id, record FROM pending_messages
        ORDER BY room_id ASC, position ASC
    "#;

    pub const GET_PENDING: &'static str =
        "SELECT record FROM pending_messages WHERE room_id = ?1 AND temporary_id = ?2";

    pub const DELETE_ROOM: &'static str = "DELETE FROM pending_messages WHERE room_id = ?1";

    pub const INSERT_PENDING: &'static str = r#"
        INSERT INTO pending_messages (room_id, temporary_id, position, record, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
    "#;

    /// New records go to the end of the room list; existing ones keep their position.
    pub const UPSERT_PENDING: &'static str = r#"
        INSERT INTO pending_messages (room_id, temporary_id, position, record, updated_at)
        VALUES (
            ?1, ?2,
            (SELECT COALESCE(MAX(position), -1) + 1 FROM pending_messages WHERE room_id = ?1),
            ?3, ?4
        )
        ON CONFLICT(room_id, temporary_id) DO UPDATE SET
            record = excluded.record,
            updated_at = excluded.updated_at
    "#;

    pub const DELETE_PENDING: &'static str =
        "DELETE FROM pending_messages WHERE room_id = ?1 AND temporary_id = ?2";

    pub const COUNT_PENDING: &'static str = "SELECT COUNT(*) as count FROM pending_messages";

    // Blob queries
    pub const UPSERT_BLOB: &'static str = r#"
        INSERT INTO attachment_blobs (key, bytes, size, mime_type, saved_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(key) DO UPDATE SET
            bytes = excluded.bytes,
            size = excluded.size,
            mime_type = excluded.mime_type,
            saved_at = excluded.saved_at
    "#;

    pub const GET_BLOB: &'static str =
        "SELECT key, bytes, size, mime_type, saved_at FROM attachment_blobs WHERE key = ?1";

    pub const DELETE_BLOB: &'static str = "DELETE FROM attachment_blobs WHERE key = ?1";

    pub const BLOB_EXISTS: &'static str =
        "SELECT COUNT(*) as count FROM attachment_blobs WHERE key = ?1";

    pub const LIST_BLOB_KEYS: &'static str = "SELECT key FROM attachment_blobs ORDER BY saved_at ASC, key ASC";
}
