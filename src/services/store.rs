use crate::{
    error::Result,
    models::{
        bookmark::{Bookmark, NewBookmark, UpdateBookmarkRequest},
        realtime::ChangeEvent,
    },
    services::change_feed::ChangeFeed,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Typed access to the `bookmarks` table. Every call is scoped to the
/// owning user; rows of other users are invisible.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    /// Newest first.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Bookmark>>;

    async fn insert(&self, user_id: Uuid, bookmark: NewBookmark) -> Result<Bookmark>;

    /// `Ok(None)` when the id does not exist for this user.
    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        changes: UpdateBookmarkRequest,
    ) -> Result<Option<Bookmark>>;

    /// Deleting a missing id is not an error.
    async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<()>;
}

/// In-process store. Publishes to the change feed on every mutation, the
/// way the Postgres trigger does for [`PgBookmarkStore`]. Events are sent
/// while the write lock is held, so they follow commit order.
///
/// [`PgBookmarkStore`]: crate::services::bookmark::PgBookmarkStore
pub struct MemoryBookmarkStore {
    rows: RwLock<Vec<Bookmark>>,
    last_created_at: RwLock<Option<DateTime<Utc>>>,
    feed: Option<ChangeFeed>,
}

impl MemoryBookmarkStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            last_created_at: RwLock::new(None),
            feed: None,
        }
    }

    pub fn with_feed(feed: ChangeFeed) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn notify(&self, user_id: Uuid, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            feed.publish(user_id, event);
        }
    }

    // Strictly increasing so inserts never tie on the sort key.
    fn next_created_at(&self) -> DateTime<Utc> {
        let mut last = self.last_created_at.write();
        let now = Utc::now();
        let created_at = match *last {
            Some(previous) if previous >= now => previous + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(created_at);
        created_at
    }
}

impl Default for MemoryBookmarkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BookmarkStore for MemoryBookmarkStore {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Bookmark>> {
        let mut bookmarks: Vec<Bookmark> = self
            .rows
            .read()
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bookmarks.sort_by(Bookmark::display_order);
        Ok(bookmarks)
    }

    async fn insert(&self, user_id: Uuid, bookmark: NewBookmark) -> Result<Bookmark> {
        let created = {
            let mut rows = self.rows.write();
            let created = Bookmark {
                id: Uuid::new_v4(),
                user_id,
                url: bookmark.url,
                title: bookmark.title,
                created_at: self.next_created_at(),
            };
            rows.push(created.clone());
            self.notify(user_id, ChangeEvent::Inserted(created.clone()));
            created
        };

        debug!("Inserted bookmark {} for user {}", created.id, user_id);
        Ok(created)
    }

    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        changes: UpdateBookmarkRequest,
    ) -> Result<Option<Bookmark>> {
        let updated = {
            let mut rows = self.rows.write();
            let Some(row) = rows.iter_mut().find(|b| b.id == id && b.user_id == user_id) else {
                return Ok(None);
            };
            if let Some(url) = changes.url {
                row.url = url;
            }
            if let Some(title) = changes.title {
                row.title = title;
            }
            let updated = row.clone();
            self.notify(user_id, ChangeEvent::Updated(updated.clone()));
            updated
        };

        Ok(Some(updated))
    }

    async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        let removed = {
            let mut rows = self.rows.write();
            let before = rows.len();
            rows.retain(|b| !(b.id == id && b.user_id == user_id));
            let removed = before != rows.len();
            if removed {
                self.notify(user_id, ChangeEvent::Deleted(id));
            }
            removed
        };

        if removed {
            debug!("Deleted bookmark {} for user {}", id, user_id);
        }
        Ok(())
    }
}
