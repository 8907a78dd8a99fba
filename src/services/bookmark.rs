use crate::{
    error::Result,
    models::bookmark::{Bookmark, NewBookmark, UpdateBookmarkRequest},
    services::{database::Database, store::BookmarkStore},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Postgres-backed store. Change events come from the table trigger, not
/// from this type.
#[derive(Clone)]
pub struct PgBookmarkStore {
    db: Arc<Database>,
}

impl PgBookmarkStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BookmarkStore for PgBookmarkStore {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Bookmark>> {
        let bookmarks = sqlx::query_as::<_, Bookmark>(
            r#"
            SELECT id, user_id, url, title, created_at
            FROM bookmarks
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;

        debug!("Loaded {} bookmarks for user {}", bookmarks.len(), user_id);
        Ok(bookmarks)
    }

    async fn insert(&self, user_id: Uuid, bookmark: NewBookmark) -> Result<Bookmark> {
        let created = sqlx::query_as::<_, Bookmark>(
            r#"
            INSERT INTO bookmarks (user_id, url, title)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, url, title, created_at
            "#,
        )
        .bind(user_id)
        .bind(&bookmark.url)
        .bind(&bookmark.title)
        .fetch_one(&self.db.pool)
        .await?;

        debug!("Inserted bookmark {} for user {}", created.id, user_id);
        Ok(created)
    }

    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        changes: UpdateBookmarkRequest,
    ) -> Result<Option<Bookmark>> {
        let updated = sqlx::query_as::<_, Bookmark>(
            r#"
            UPDATE bookmarks
            SET url = COALESCE($3, url),
                title = COALESCE($4, title)
            WHERE id = $1 AND user_id = $2
            RETURNING id, user_id, url, title, created_at
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(changes.url)
        .bind(changes.title)
        .fetch_optional(&self.db.pool)
        .await?;

        Ok(updated)
    }

    async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM bookmarks WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.db.pool)
            .await?;

        debug!(
            "Delete of bookmark {} for user {} affected {} rows",
            id,
            user_id,
            result.rows_affected()
        );
        Ok(())
    }
}
