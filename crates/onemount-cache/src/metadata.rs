//! Durable metadata store.
//!
//! The authoritative map from item id to [`Entry`], plus the sibling
//! buckets that must share its durability: persisted upload sessions,
//! the offline change journal, and the delta cursor. One SQLite
//! database holds all four as tables; a batch applied through
//! [`MetadataStore::apply_batch`] is transactional, so after a crash
//! either all changes in the batch are present or none are.
//!
//! ## Column strategy
//!
//! Entries are stored as a serde-JSON document alongside the columns
//! queries filter on (`parent_id`, lowercased `name_fold`, `state`).
//! The document is the source of truth; the columns are derived on
//! every save.

use sqlx::Row;

use onemount_core::domain::{DeltaCursor, Entry, ItemId, OfflineChange, UploadSession};

use crate::{CacheError, DatabasePool};

/// Key under which the delta cursor is stored in the `deltas` bucket.
const CURSOR_KEY: &str = "cursor";

/// One operation of a transactional batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Save(Entry),
    Delete(ItemId),
    SaveCursor(DeltaCursor),
}

/// SQLite-backed metadata store.
#[derive(Clone)]
pub struct MetadataStore {
    pool: DatabasePool,
}

impl MetadataStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // metadata bucket
    // ------------------------------------------------------------------

    /// Persists an entry, replacing any previous version atomically.
    pub async fn save(&self, entry: &Entry) -> Result<(), CacheError> {
        let doc = serde_json::to_string(entry)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?;
        sqlx::query(
            "INSERT OR REPLACE INTO metadata (id, parent_id, name_fold, state, entry) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.id().to_string())
        .bind(entry.parent_id().to_string())
        .bind(entry.name().to_lowercase())
        .bind(entry.state().name())
        .bind(doc)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Loads an entry; [`CacheError::NotFound`] if absent.
    pub async fn get(&self, id: &ItemId) -> Result<Entry, CacheError> {
        self.try_get(id)
            .await?
            .ok_or_else(|| CacheError::NotFound(id.to_string()))
    }

    /// Loads an entry if present.
    pub async fn try_get(&self, id: &ItemId) -> Result<Option<Entry>, CacheError> {
        let row = sqlx::query("SELECT entry FROM metadata WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool.pool())
            .await?;
        row.map(|r| entry_from_doc(&r.get::<String, _>("entry")))
            .transpose()
    }

    /// Removes an entry.
    pub async fn delete(&self, id: &ItemId) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM metadata WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// All entries whose parent is `parent_id`, ordered by folded name.
    pub async fn list_children(&self, parent_id: &ItemId) -> Result<Vec<Entry>, CacheError> {
        let rows = sqlx::query(
            "SELECT entry FROM metadata WHERE parent_id = ? ORDER BY name_fold",
        )
        .bind(parent_id.to_string())
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter()
            .map(|r| entry_from_doc(&r.get::<String, _>("entry")))
            .collect()
    }

    /// Case-insensitive child lookup.
    pub async fn child_by_name(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<Option<Entry>, CacheError> {
        let row = sqlx::query(
            "SELECT entry FROM metadata WHERE parent_id = ? AND name_fold = ?",
        )
        .bind(parent_id.to_string())
        .bind(name.to_lowercase())
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(|r| entry_from_doc(&r.get::<String, _>("entry")))
            .transpose()
    }

    /// Every entry in the store. Used at mount for inode population and
    /// crash recovery.
    pub async fn all_entries(&self) -> Result<Vec<Entry>, CacheError> {
        let rows = sqlx::query("SELECT entry FROM metadata")
            .fetch_all(self.pool.pool())
            .await?;
        rows.iter()
            .map(|r| entry_from_doc(&r.get::<String, _>("entry")))
            .collect()
    }

    /// Number of entries, for statfs synthesis.
    pub async fn count_entries(&self) -> Result<u64, CacheError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM metadata")
            .fetch_one(self.pool.pool())
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Read-modify-write under a transaction.
    ///
    /// The closure sees the freshly loaded entry; the mutated entry is
    /// written back before the transaction commits and returned.
    pub async fn update<F>(&self, id: &ItemId, f: F) -> Result<Entry, CacheError>
    where
        F: FnOnce(&mut Entry),
    {
        let mut tx = self.pool.pool().begin().await?;
        let row = sqlx::query("SELECT entry FROM metadata WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        let mut entry = entry_from_doc(&row.get::<String, _>("entry"))?;
        f(&mut entry);
        write_entry(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Applies a set of operations in one transaction.
    pub async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), CacheError> {
        let mut tx = self.pool.pool().begin().await?;
        for op in ops {
            match op {
                BatchOp::Save(entry) => write_entry(&mut tx, &entry).await?,
                BatchOp::Delete(id) => {
                    sqlx::query("DELETE FROM metadata WHERE id = ?")
                        .bind(id.to_string())
                        .execute(&mut *tx)
                        .await?;
                }
                BatchOp::SaveCursor(cursor) => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO deltas (key, value) VALUES (?, ?)",
                    )
                    .bind(CURSOR_KEY)
                    .bind(cursor.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Exchanges a provisional id for the remote-assigned one.
    ///
    /// Rewrites the entry row, the parent's child list, any persisted
    /// upload session, and any journaled offline changes in a single
    /// transaction; readers see the old id or the new one, never a mix.
    pub async fn exchange_id(&self, old: &ItemId, new: &ItemId) -> Result<Entry, CacheError> {
        let mut tx = self.pool.pool().begin().await?;

        let row = sqlx::query("SELECT entry FROM metadata WHERE id = ?")
            .bind(old.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CacheError::NotFound(old.to_string()))?;
        let mut entry = entry_from_doc(&row.get::<String, _>("entry"))?;
        entry.set_id(new.clone());

        sqlx::query("DELETE FROM metadata WHERE id = ?")
            .bind(old.to_string())
            .execute(&mut *tx)
            .await?;
        write_entry(&mut tx, &entry).await?;

        // Parent's child list.
        let parent_row = sqlx::query("SELECT entry FROM metadata WHERE id = ?")
            .bind(entry.parent_id().to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(parent_row) = parent_row {
            let mut parent = entry_from_doc(&parent_row.get::<String, _>("entry"))?;
            parent.replace_child(old, new.clone());
            write_entry(&mut tx, &parent).await?;
        }

        // Children of a renamed directory keep pointing at it.
        sqlx::query("UPDATE metadata SET parent_id = ? WHERE parent_id = ?")
            .bind(new.to_string())
            .bind(old.to_string())
            .execute(&mut *tx)
            .await?;
        let child_rows = sqlx::query("SELECT id, entry FROM metadata WHERE parent_id = ?")
            .bind(new.to_string())
            .fetch_all(&mut *tx)
            .await?;
        for child_row in child_rows {
            let mut child = entry_from_doc(&child_row.get::<String, _>("entry"))?;
            if child.parent_id() == old {
                child.set_parent_id(new.clone());
                write_entry(&mut tx, &child).await?;
            }
        }

        // Persisted upload sessions.
        let upload_row = sqlx::query("SELECT session, can_resume FROM uploads WHERE id = ?")
            .bind(old.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(upload_row) = upload_row {
            let mut session: UploadSession =
                serde_json::from_str(&upload_row.get::<String, _>("session"))
                    .map_err(|e| CacheError::SerializationError(e.to_string()))?;
            session.id = new.clone();
            let doc = serde_json::to_string(&session)
                .map_err(|e| CacheError::SerializationError(e.to_string()))?;
            sqlx::query("DELETE FROM uploads WHERE id = ?")
                .bind(old.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT OR REPLACE INTO uploads (id, can_resume, session) VALUES (?, ?, ?)")
                .bind(new.to_string())
                .bind(upload_row.get::<i64, _>("can_resume"))
                .bind(doc)
                .execute(&mut *tx)
                .await?;
        }

        // Journaled offline changes.
        let change_rows = sqlx::query("SELECT seq, change FROM offline_changes WHERE item_id = ?")
            .bind(old.to_string())
            .fetch_all(&mut *tx)
            .await?;
        for change_row in change_rows {
            let mut change: OfflineChange =
                serde_json::from_str(&change_row.get::<String, _>("change"))
                    .map_err(|e| CacheError::SerializationError(e.to_string()))?;
            change.id = new.clone();
            let doc = serde_json::to_string(&change)
                .map_err(|e| CacheError::SerializationError(e.to_string()))?;
            sqlx::query("UPDATE offline_changes SET item_id = ?, change = ? WHERE seq = ?")
                .bind(new.to_string())
                .bind(doc)
                .bind(change_row.get::<i64, _>("seq"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(entry)
    }

    // ------------------------------------------------------------------
    // uploads bucket
    // ------------------------------------------------------------------

    /// Persists (or checkpoints) an upload session.
    pub async fn save_upload(&self, session: &UploadSession) -> Result<(), CacheError> {
        let doc = serde_json::to_string(session)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?;
        sqlx::query("INSERT OR REPLACE INTO uploads (id, can_resume, session) VALUES (?, ?, ?)")
            .bind(session.id.to_string())
            .bind(session.can_resume as i64)
            .bind(doc)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Loads a persisted upload session, if any.
    pub async fn get_upload(&self, id: &ItemId) -> Result<Option<UploadSession>, CacheError> {
        let row = sqlx::query("SELECT session FROM uploads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool.pool())
            .await?;
        row.map(|r| {
            serde_json::from_str(&r.get::<String, _>("session"))
                .map_err(|e| CacheError::SerializationError(e.to_string()))
        })
        .transpose()
    }

    /// Removes a persisted upload session.
    pub async fn delete_upload(&self, id: &ItemId) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Sessions that can resume after a restart.
    pub async fn resumable_uploads(&self) -> Result<Vec<UploadSession>, CacheError> {
        let rows = sqlx::query("SELECT session FROM uploads WHERE can_resume = 1")
            .fetch_all(self.pool.pool())
            .await?;
        rows.iter()
            .map(|r| {
                serde_json::from_str(&r.get::<String, _>("session"))
                    .map_err(|e| CacheError::SerializationError(e.to_string()))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // offline_changes bucket
    // ------------------------------------------------------------------

    /// Appends a change to the journal and assigns its sequence number.
    pub async fn append_offline_change(
        &self,
        change: &mut OfflineChange,
    ) -> Result<i64, CacheError> {
        // The sequence number is part of the persisted document, so
        // write a placeholder row first and patch the document.
        let mut tx = self.pool.pool().begin().await?;
        let result = sqlx::query("INSERT INTO offline_changes (item_id, change) VALUES (?, ?)")
            .bind(change.id.to_string())
            .bind("{}")
            .execute(&mut *tx)
            .await?;
        change.seq = result.last_insert_rowid();
        let doc = serde_json::to_string(change)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?;
        sqlx::query("UPDATE offline_changes SET change = ? WHERE seq = ?")
            .bind(doc)
            .bind(change.seq)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(change.seq)
    }

    /// All journaled changes in sequence order.
    pub async fn offline_changes(&self) -> Result<Vec<OfflineChange>, CacheError> {
        let rows = sqlx::query("SELECT change FROM offline_changes ORDER BY seq")
            .fetch_all(self.pool.pool())
            .await?;
        rows.iter()
            .map(|r| {
                serde_json::from_str(&r.get::<String, _>("change"))
                    .map_err(|e| CacheError::SerializationError(e.to_string()))
            })
            .collect()
    }

    /// Whether any journaled change targets `id`.
    pub async fn has_offline_changes(&self, id: &ItemId) -> Result<bool, CacheError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM offline_changes WHERE item_id = ?")
            .bind(id.to_string())
            .fetch_one(self.pool.pool())
            .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    /// Removes one replayed change.
    pub async fn remove_offline_change(&self, seq: i64) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM offline_changes WHERE seq = ?")
            .bind(seq)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // deltas bucket
    // ------------------------------------------------------------------

    /// The persisted delta cursor, if a sync has completed before.
    pub async fn delta_cursor(&self) -> Result<Option<DeltaCursor>, CacheError> {
        let row = sqlx::query("SELECT value FROM deltas WHERE key = ?")
            .bind(CURSOR_KEY)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(|r| DeltaCursor::new(r.get::<String, _>("value"))))
    }

    /// Persists the delta cursor. Callers do this only after the batch
    /// that produced it has been applied.
    pub async fn save_delta_cursor(&self, cursor: &DeltaCursor) -> Result<(), CacheError> {
        sqlx::query("INSERT OR REPLACE INTO deltas (key, value) VALUES (?, ?)")
            .bind(CURSOR_KEY)
            .bind(cursor.as_str())
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn entry_from_doc(doc: &str) -> Result<Entry, CacheError> {
    serde_json::from_str(doc).map_err(|e| {
        CacheError::SerializationError(format!("failed to reconstruct entry from row: {}", e))
    })
}

async fn write_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &Entry,
) -> Result<(), CacheError> {
    let doc = serde_json::to_string(entry)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;
    sqlx::query(
        "INSERT OR REPLACE INTO metadata (id, parent_id, name_fold, state, entry) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(entry.id().to_string())
    .bind(entry.parent_id().to_string())
    .bind(entry.name().to_lowercase())
    .bind(entry.state().name())
    .bind(doc)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
