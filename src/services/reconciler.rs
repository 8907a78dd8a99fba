//! Client-side projection of one user's bookmarks.
//!
//! The projection starts in `Loading`, becomes `Ready` when the initial
//! snapshot lands and ends in `Disposed` when its view goes away. Every
//! change is keyed by bookmark id, so applying an event twice, or applying
//! it before instead of after the snapshot, gives the same list.
//!
//! A snapshot may have been read before events that the view has already
//! applied. While any load is in flight the projection keeps a log of the
//! events it sees and replays it over each snapshot that lands, so a
//! refetch never drops a change committed after its query ran.

use crate::models::{
    bookmark::Bookmark,
    realtime::{ChangeEvent, ViewFrame, ViewState},
};
use std::{cmp::Ordering, collections::HashSet};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Projection {
    state: ViewState,
    bookmarks: Vec<Bookmark>,
    // Events seen since the oldest in-flight load started.
    pending: Vec<ChangeEvent>,
    loads_in_flight: usize,
    error: Option<String>,
}

impl Default for Projection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection {
    pub fn new() -> Self {
        Self {
            state: ViewState::Loading,
            bookmarks: Vec::new(),
            pending: Vec::new(),
            loads_in_flight: 0,
            error: None,
        }
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn bookmarks(&self) -> &[Bookmark] {
        &self.bookmarks
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.position(id).is_some()
    }

    /// Applies one feed event. Returns whether the visible list changed.
    pub fn apply(&mut self, event: ChangeEvent) -> bool {
        match self.state {
            ViewState::Loading => {
                debug!("Buffering {} until the snapshot arrives", event.record_id());
                self.pending.push(event);
                false
            }
            ViewState::Ready if self.loads_in_flight > 0 => {
                self.pending.push(event.clone());
                self.apply_ready(event)
            }
            ViewState::Ready => self.apply_ready(event),
            ViewState::Disposed => false,
        }
    }

    /// Marks a snapshot query as started. Every call is settled by exactly
    /// one `load_snapshot`/`reload` or `snapshot_failed`.
    pub fn begin_load(&mut self) {
        if self.state != ViewState::Disposed {
            self.loads_in_flight += 1;
        }
    }

    pub fn loads_in_flight(&self) -> usize {
        self.loads_in_flight
    }

    /// Replaces the list with an authoritative snapshot and replays the
    /// events logged since the oldest in-flight load began.
    pub fn load_snapshot(&mut self, snapshot: Vec<Bookmark>) -> bool {
        if self.state == ViewState::Disposed {
            return false;
        }
        self.loads_in_flight = self.loads_in_flight.saturating_sub(1);

        let mut seen = HashSet::with_capacity(snapshot.len());
        let mut bookmarks: Vec<Bookmark> = snapshot
            .into_iter()
            .filter(|b| seen.insert(b.id))
            .collect();
        bookmarks.sort_by(Bookmark::display_order);

        self.bookmarks = bookmarks;
        self.state = ViewState::Ready;
        self.replay_pending();

        true
    }

    /// Full replace after a failed delete or a lagged feed.
    pub fn reload(&mut self, snapshot: Vec<Bookmark>) -> bool {
        self.load_snapshot(snapshot)
    }

    /// A load failed: show the error. On first load, start applying live
    /// events to whatever is known (nothing yet).
    pub fn snapshot_failed(&mut self, message: impl Into<String>) {
        if self.state == ViewState::Disposed {
            return;
        }
        self.loads_in_flight = self.loads_in_flight.saturating_sub(1);
        self.error = Some(message.into());

        if self.state == ViewState::Loading {
            self.state = ViewState::Ready;
            self.replay_pending();
        } else if self.loads_in_flight == 0 {
            self.pending.clear();
        }
    }

    /// Removes an entry ahead of the store confirming the delete.
    pub fn remove_optimistic(&mut self, id: Uuid) -> Option<Bookmark> {
        if self.state == ViewState::Disposed {
            return None;
        }
        self.position(id).map(|index| self.bookmarks.remove(index))
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.state != ViewState::Disposed {
            self.error = Some(message.into());
        }
    }

    pub fn clear_error(&mut self) -> bool {
        self.error.take().is_some()
    }

    pub fn dispose(&mut self) {
        self.state = ViewState::Disposed;
        self.pending.clear();
        self.loads_in_flight = 0;
    }

    pub fn frame(&self) -> ViewFrame {
        ViewFrame {
            state: self.state,
            bookmarks: self.bookmarks.clone(),
            error: self.error.clone(),
        }
    }

    // The log is kept while later loads are still outstanding: their
    // snapshots may be older than events already applied.
    fn replay_pending(&mut self) {
        let pending = if self.loads_in_flight == 0 {
            std::mem::take(&mut self.pending)
        } else {
            self.pending.clone()
        };
        if !pending.is_empty() {
            debug!("Replaying {} logged events over snapshot", pending.len());
        }
        for event in pending {
            self.apply_ready(event);
        }
    }

    fn apply_ready(&mut self, event: ChangeEvent) -> bool {
        match event {
            ChangeEvent::Inserted(record) => {
                if self.contains(record.id) {
                    return false;
                }
                self.insert_sorted(record);
                true
            }
            ChangeEvent::Updated(record) => match self.position(record.id) {
                Some(index) if self.bookmarks[index] == record => false,
                Some(index) if self.bookmarks[index].created_at == record.created_at => {
                    self.bookmarks[index] = record;
                    true
                }
                Some(index) => {
                    self.bookmarks.remove(index);
                    self.insert_sorted(record);
                    true
                }
                None => false,
            },
            ChangeEvent::Deleted(id) => match self.position(id) {
                Some(index) => {
                    self.bookmarks.remove(index);
                    true
                }
                None => false,
            },
        }
    }

    fn insert_sorted(&mut self, record: Bookmark) {
        let index = self
            .bookmarks
            .partition_point(|b| Bookmark::display_order(b, &record) == Ordering::Less);
        self.bookmarks.insert(index, record);
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.bookmarks.iter().position(|b| b.id == id)
    }
}
