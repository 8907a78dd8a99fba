use async_trait::async_trait;
use smart_bookmarks::{
    error::{AppError, Result},
    models::{
        bookmark::{Bookmark, NewBookmark, UpdateBookmarkRequest},
        realtime::{ChangeEvent, SubmissionFrame, ViewFrame, ViewState},
    },
    services::{
        auth::SessionUser,
        change_feed::ChangeFeed,
        live_view::{LiveView, ViewCommand, ViewOutput, DELETE_FAILED, LOAD_FAILED},
        store::{BookmarkStore, MemoryBookmarkStore},
        submission::SubmissionService,
    },
    utils::validation::INVALID_URL,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

/// Memory store whose reads and deletes can be switched to fail.
struct FlakyStore {
    inner: MemoryBookmarkStore,
    fail_list: AtomicBool,
    fail_delete: AtomicBool,
}

impl FlakyStore {
    fn new(feed: &ChangeFeed) -> Self {
        Self {
            inner: MemoryBookmarkStore::with_feed(feed.clone()),
            fail_list: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BookmarkStore for FlakyStore {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Bookmark>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(AppError::store("connection reset"));
        }
        self.inner.list_for_user(user_id).await
    }

    async fn insert(&self, user_id: Uuid, bookmark: NewBookmark) -> Result<Bookmark> {
        self.inner.insert(user_id, bookmark).await
    }

    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        changes: UpdateBookmarkRequest,
    ) -> Result<Option<Bookmark>> {
        self.inner.update(user_id, id, changes).await
    }

    async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(AppError::store("network down"));
        }
        self.inner.delete(user_id, id).await
    }
}

/// Memory store whose deletes always fail and whose second read holds its
/// result until released, after the rows were already read.
struct SlowRefetchStore {
    inner: MemoryBookmarkStore,
    reads: AtomicUsize,
    refetch_read: Notify,
    release_refetch: Notify,
}

impl SlowRefetchStore {
    fn new(feed: &ChangeFeed) -> Self {
        Self {
            inner: MemoryBookmarkStore::with_feed(feed.clone()),
            reads: AtomicUsize::new(0),
            refetch_read: Notify::new(),
            release_refetch: Notify::new(),
        }
    }
}

#[async_trait]
impl BookmarkStore for SlowRefetchStore {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Bookmark>> {
        let rows = self.inner.list_for_user(user_id).await?;
        if self.reads.fetch_add(1, Ordering::SeqCst) == 1 {
            self.refetch_read.notify_one();
            self.release_refetch.notified().await;
        }
        Ok(rows)
    }

    async fn insert(&self, user_id: Uuid, bookmark: NewBookmark) -> Result<Bookmark> {
        self.inner.insert(user_id, bookmark).await
    }

    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        changes: UpdateBookmarkRequest,
    ) -> Result<Option<Bookmark>> {
        self.inner.update(user_id, id, changes).await
    }

    async fn delete(&self, _user_id: Uuid, _id: Uuid) -> Result<()> {
        Err(AppError::store("network down"))
    }
}

struct Harness {
    commands: mpsc::Sender<ViewCommand>,
    outputs: mpsc::UnboundedReceiver<ViewOutput>,
    task: JoinHandle<()>,
}

impl Harness {
    fn open(user: &SessionUser, store: Arc<dyn BookmarkStore>, feed: &ChangeFeed) -> Self {
        let (output_tx, outputs) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::channel(16);
        let submission = SubmissionService::new(store.clone(), Duration::from_secs(3));
        let view = LiveView::new(user.clone(), store, feed.clone(), submission, output_tx);
        let task = tokio::spawn(view.run(command_rx));

        Self {
            commands,
            outputs,
            task,
        }
    }

    async fn send(&self, command: ViewCommand) {
        self.commands.send(command).await.expect("view stopped");
    }

    async fn next(&mut self) -> ViewOutput {
        tokio::time::timeout(WAIT, self.outputs.recv())
            .await
            .expect("timed out waiting for view output")
            .expect("view output closed")
    }

    async fn view_where(&mut self, predicate: impl Fn(&ViewFrame) -> bool) -> ViewFrame {
        loop {
            if let ViewOutput::View(frame) = self.next().await {
                if predicate(&frame) {
                    return frame;
                }
            }
        }
    }

    async fn ready(&mut self) -> ViewFrame {
        self.view_where(|f| f.state == ViewState::Ready).await
    }

    async fn submission(&mut self) -> SubmissionFrame {
        loop {
            if let ViewOutput::Submission(frame) = self.next().await {
                return frame;
            }
        }
    }

    async fn close(self) {
        drop(self.commands);
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("view did not stop")
            .expect("view panicked");
    }
}

fn session(name: &str) -> SessionUser {
    SessionUser {
        id: Uuid::new_v4(),
        email: format!("{}@example.com", name),
        name: Some(name.to_string()),
        avatar_url: None,
    }
}

fn titles(frame: &ViewFrame) -> Vec<&str> {
    frame.bookmarks.iter().map(|b| b.title.as_str()).collect()
}

async fn seed(store: &MemoryBookmarkStore, user: &SessionUser, title: &str) -> Bookmark {
    store
        .insert(
            user.id,
            NewBookmark {
                url: format!("https://{}.example", title),
                title: title.to_string(),
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn view_starts_loading_then_shows_snapshot() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let user = session("ada");
    seed(&store, &user, "older").await;
    seed(&store, &user, "newer").await;

    let mut view = Harness::open(&user, store.clone(), &feed);

    match view.next().await {
        ViewOutput::View(frame) => assert_eq!(frame.state, ViewState::Loading),
        other => panic!("expected a loading frame, got {:?}", other),
    }
    let frame = view.ready().await;
    assert_eq!(titles(&frame), vec!["newer", "older"]);
    assert!(frame.error.is_none());

    view.close().await;
}

#[tokio::test]
async fn add_appears_at_top_through_the_feed() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let user = session("ada");
    seed(&store, &user, "existing").await;

    let mut view = Harness::open(&user, store.clone(), &feed);
    view.ready().await;

    view.send(ViewCommand::Add {
        url: "https://a.com".to_string(),
        title: "A".to_string(),
    })
    .await;

    let form = view.submission().await;
    assert!(form.success);
    assert!(form.error.is_none());
    assert!(form.url.is_empty() && form.title.is_empty());

    let frame = view.view_where(|f| f.bookmarks.len() == 2).await;
    assert_eq!(titles(&frame), vec!["A", "existing"]);
    assert_eq!(frame.bookmarks[0].url, "https://a.com");
    assert!(frame.bookmarks.iter().all(|b| b.user_id == user.id));

    view.close().await;
}

#[tokio::test]
async fn invalid_url_is_rejected_without_store_call() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let user = session("ada");

    let mut view = Harness::open(&user, store.clone(), &feed);
    view.ready().await;

    view.send(ViewCommand::Add {
        url: "not-a-url".to_string(),
        title: "X".to_string(),
    })
    .await;

    let form = view.submission().await;
    assert_eq!(form.error.as_deref(), Some(INVALID_URL));
    assert_eq!(form.url, "not-a-url");
    assert_eq!(form.title, "X");
    assert!(!form.success);
    assert!(store.is_empty());

    view.close().await;
}

#[tokio::test]
async fn delete_is_optimistic_and_echo_is_ignored() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let user = session("ada");
    let keep = seed(&store, &user, "keep").await;
    let gone = seed(&store, &user, "gone").await;

    let mut view = Harness::open(&user, store.clone(), &feed);
    assert_eq!(view.ready().await.bookmarks.len(), 2);

    view.send(ViewCommand::Delete(gone.id)).await;
    let frame = view.view_where(|f| f.bookmarks.len() == 1).await;
    assert_eq!(frame.bookmarks[0].id, keep.id);
    assert!(store.list_for_user(user.id).await.unwrap().iter().all(|b| b.id != gone.id));

    // A duplicate delete event changes nothing; the next frame comes from
    // the following insert and still lacks the deleted row.
    feed.publish(user.id, ChangeEvent::Deleted(gone.id));
    seed(&store, &user, "later").await;
    let frame = view.view_where(|f| f.bookmarks.len() == 2).await;
    assert_eq!(titles(&frame), vec!["later", "keep"]);

    view.close().await;
}

#[tokio::test]
async fn failed_delete_shows_error_and_refetches() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(FlakyStore::new(&feed));
    let user = session("ada");
    let target = seed(&store.inner, &user, "target").await;

    let mut view = Harness::open(&user, store.clone(), &feed);
    view.ready().await;

    store.fail_delete.store(true, Ordering::SeqCst);
    view.send(ViewCommand::Delete(target.id)).await;

    // Optimistic removal first.
    view.view_where(|f| f.bookmarks.is_empty()).await;

    let mut saw_error = false;
    let restored = loop {
        match view.next().await {
            ViewOutput::Error { message, .. } => {
                assert_eq!(message, DELETE_FAILED);
                saw_error = true;
            }
            ViewOutput::View(frame) if frame.bookmarks.len() == 1 => break frame,
            _ => {}
        }
    };

    assert!(saw_error);
    assert_eq!(restored.bookmarks[0].id, target.id);
    assert_eq!(restored.error.as_deref(), Some(DELETE_FAILED));

    view.close().await;
}

#[tokio::test]
async fn refetch_does_not_drop_rows_inserted_while_it_runs() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(SlowRefetchStore::new(&feed));
    let user = session("ada");

    let mut view = Harness::open(&user, store.clone(), &feed);
    assert!(view.ready().await.bookmarks.is_empty());

    // The failing delete starts a refetch; its rows are read before the insert.
    view.send(ViewCommand::Delete(Uuid::new_v4())).await;
    tokio::time::timeout(WAIT, store.refetch_read.notified())
        .await
        .expect("refetch never read the store");

    let inserted = seed(&store.inner, &user, "X").await;
    let frame = view.view_where(|f| !f.bookmarks.is_empty()).await;
    assert_eq!(titles(&frame), vec!["X"]);

    store.release_refetch.notify_one();
    let landed = view.view_where(|_| true).await;
    assert_eq!(titles(&landed), vec!["X"]);
    assert_eq!(landed.bookmarks[0].id, inserted.id);
    assert_eq!(landed.error.as_deref(), Some(DELETE_FAILED));
    assert_eq!(store.inner.len(), 1);

    view.close().await;
}

#[tokio::test]
async fn failed_initial_load_still_applies_events() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(FlakyStore::new(&feed));
    store.fail_list.store(true, Ordering::SeqCst);
    let user = session("ada");

    let mut view = Harness::open(&user, store.clone(), &feed);
    let frame = view.ready().await;
    assert_eq!(frame.error.as_deref(), Some(LOAD_FAILED));
    assert!(frame.bookmarks.is_empty());

    seed(&store.inner, &user, "live").await;
    let frame = view.view_where(|f| !f.bookmarks.is_empty()).await;
    assert_eq!(titles(&frame), vec!["live"]);

    view.close().await;
}

#[tokio::test]
async fn other_views_see_changes_but_other_users_do_not() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let ada = session("ada");
    let bob = session("bob");

    let mut first_tab = Harness::open(&ada, store.clone(), &feed);
    let mut second_tab = Harness::open(&ada, store.clone(), &feed);
    let mut bobs_tab = Harness::open(&bob, store.clone(), &feed);
    first_tab.ready().await;
    second_tab.ready().await;
    bobs_tab.ready().await;

    first_tab
        .send(ViewCommand::Add {
            url: "https://shared.example".to_string(),
            title: "Shared".to_string(),
        })
        .await;

    let frame = second_tab.view_where(|f| !f.bookmarks.is_empty()).await;
    assert_eq!(titles(&frame), vec!["Shared"]);

    // Bob's view only changes for Bob's rows.
    seed(&store, &bob, "bobs").await;
    let frame = bobs_tab.view_where(|f| !f.bookmarks.is_empty()).await;
    assert_eq!(titles(&frame), vec!["bobs"]);

    first_tab.close().await;
    second_tab.close().await;
    bobs_tab.close().await;
}

#[tokio::test]
async fn closing_the_view_releases_its_subscription() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let user = session("ada");

    let mut view = Harness::open(&user, store.clone(), &feed);
    view.ready().await;
    assert_eq!(feed.subscriptions_for_user(user.id), 1);

    view.close().await;
    assert_eq!(feed.active_subscriptions(), 0);

    // Mutations after teardown reach nobody.
    seed(&store, &user, "after").await;
    assert_eq!(feed.publish(user.id, ChangeEvent::Deleted(Uuid::new_v4())), 0);
}

#[tokio::test]
async fn view_stops_when_client_stops_listening() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let user = session("ada");

    let mut view = Harness::open(&user, store.clone(), &feed);
    view.ready().await;

    let Harness { commands, outputs, task } = view;
    drop(outputs);
    seed(&store, &user, "nobody-watching").await;

    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(feed.active_subscriptions(), 0);
    drop(commands);
}

#[tokio::test]
async fn ping_gets_pong() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let user = session("ada");

    let mut view = Harness::open(&user, store, &feed);
    view.ready().await;
    view.send(ViewCommand::Ping).await;
    assert_eq!(view.next().await, ViewOutput::Pong);

    view.close().await;
}

#[tokio::test(start_paused = true)]
async fn success_flag_is_cleared_after_flash() {
    let feed = ChangeFeed::new(64);
    let store = Arc::new(MemoryBookmarkStore::with_feed(feed.clone()));
    let user = session("ada");

    let mut view = Harness::open(&user, store, &feed);
    view.ready().await;

    view.send(ViewCommand::Add {
        url: "https://a.com".to_string(),
        title: "A".to_string(),
    })
    .await;
    assert!(view.submission().await.success);

    let cleared = view.submission().await;
    assert!(!cleared.success);
    assert!(cleared.error.is_none());

    view.close().await;
}
