//! One live list view: a single task that owns a [`Projection`] and the
//! add-bookmark form for one connection.
//!
//! The task subscribes to the change feed before it starts loading the
//! snapshot, so no event committed after the snapshot query is missed.
//! Events that beat a snapshot, first load or refetch, are replayed over
//! it by the projection.

use crate::{
    error::{AppError, Result},
    models::{
        bookmark::Bookmark,
        realtime::{
            AddBookmarkCommand, DeleteBookmarkCommand, LiveMessage, LiveMessageType,
            SubmissionFrame, ViewFrame,
        },
    },
    services::{
        auth::SessionUser,
        change_feed::{ChangeFeed, FeedSignal},
        reconciler::Projection,
        store::BookmarkStore,
        submission::{SubmissionForm, SubmissionService},
    },
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const LOAD_FAILED: &str = "Failed to load bookmarks";
pub const DELETE_FAILED: &str = "Failed to delete bookmark";

/// 客户端发来的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewCommand {
    Add { url: String, title: String },
    Delete(Uuid),
    Ping,
}

impl ViewCommand {
    /// Parses a client envelope. Server-only message types are rejected.
    pub fn from_message(message: LiveMessage) -> Result<Self> {
        match message.message_type {
            LiveMessageType::AddBookmark => {
                let command: AddBookmarkCommand = serde_json::from_value(message.data)?;
                Ok(ViewCommand::Add {
                    url: command.url,
                    title: command.title,
                })
            }
            LiveMessageType::DeleteBookmark => {
                let command: DeleteBookmarkCommand = serde_json::from_value(message.data)?;
                Ok(ViewCommand::Delete(command.id))
            }
            LiveMessageType::Ping => Ok(ViewCommand::Ping),
            other => Err(AppError::BadRequest(format!(
                "Unsupported message type: {:?}",
                other
            ))),
        }
    }
}

/// 发往客户端的输出
#[derive(Debug, Clone, PartialEq)]
pub enum ViewOutput {
    View(ViewFrame),
    Submission(SubmissionFrame),
    Pong,
    Error { code: String, message: String },
}

impl ViewOutput {
    pub fn into_message(self) -> LiveMessage {
        match self {
            ViewOutput::View(frame) => LiveMessage::view(&frame),
            ViewOutput::Submission(frame) => LiveMessage::submission(&frame),
            ViewOutput::Pong => LiveMessage::pong(),
            ViewOutput::Error { code, message } => LiveMessage::error(&code, &message),
        }
    }
}

type SnapshotResult = Result<Vec<Bookmark>>;

pub struct LiveView {
    user: SessionUser,
    store: Arc<dyn BookmarkStore>,
    feed: ChangeFeed,
    submission: SubmissionService,
    output: mpsc::UnboundedSender<ViewOutput>,
}

impl LiveView {
    pub fn new(
        user: SessionUser,
        store: Arc<dyn BookmarkStore>,
        feed: ChangeFeed,
        submission: SubmissionService,
        output: mpsc::UnboundedSender<ViewOutput>,
    ) -> Self {
        Self {
            user,
            store,
            feed,
            submission,
            output,
        }
    }

    /// Runs until the command channel closes, the client stops listening
    /// or the feed shuts down. The subscription is released on every exit.
    pub async fn run(self, mut commands: mpsc::Receiver<ViewCommand>) {
        let mut subscription = self.feed.subscribe(self.user.id);
        let mut projection = Projection::new();
        let mut form = SubmissionForm::new();

        info!("Live view opened for user {}", self.user.id);

        let (snapshot_tx, mut snapshot_rx) = mpsc::unbounded_channel::<SnapshotResult>();
        self.load(&mut projection, &snapshot_tx);

        if self.emit(ViewOutput::View(projection.frame())).is_ok() {
            loop {
                let flash_deadline = form.success_until;

                let keep_going = tokio::select! {
                    Some(result) = snapshot_rx.recv() => {
                        self.on_snapshot(&mut projection, result)
                    }
                    signal = subscription.recv() => match signal {
                        Some(FeedSignal::Event(event)) => {
                            if projection.apply(event) {
                                self.emit(ViewOutput::View(projection.frame())).is_ok()
                            } else {
                                true
                            }
                        }
                        Some(FeedSignal::Lagged(skipped)) => {
                            debug!("Feed lagged by {} events, refetching", skipped);
                            self.load(&mut projection, &snapshot_tx);
                            true
                        }
                        None => false,
                    },
                    command = commands.recv() => match command {
                        Some(command) => {
                            self.on_command(command, &mut projection, &mut form, &snapshot_tx).await
                        }
                        None => false,
                    },
                    _ = wait_for(flash_deadline), if flash_deadline.is_some() => {
                        let now = Instant::now();
                        if form.dismiss_success_if_due(now) {
                            self.emit(ViewOutput::Submission(form.frame(now))).is_ok()
                        } else {
                            true
                        }
                    }
                };

                if !keep_going {
                    break;
                }
            }
        }

        subscription.unsubscribe();
        projection.dispose();
        info!("Live view closed for user {}", self.user.id);
    }

    fn on_snapshot(&self, projection: &mut Projection, result: SnapshotResult) -> bool {
        match result {
            Ok(bookmarks) => {
                projection.reload(bookmarks);
            }
            Err(e) => {
                warn!("Error fetching bookmarks: {}", e);
                projection.snapshot_failed(LOAD_FAILED);
            }
        }
        self.emit(ViewOutput::View(projection.frame())).is_ok()
    }

    async fn on_command(
        &self,
        command: ViewCommand,
        projection: &mut Projection,
        form: &mut SubmissionForm,
        snapshot_tx: &mpsc::UnboundedSender<SnapshotResult>,
    ) -> bool {
        match command {
            ViewCommand::Add { url, title } => {
                form.url = url;
                form.title = title;
                // Result is reflected in the form; the row arrives via the feed.
                let _ = self.submission.submit(&self.user, form).await;
                self.emit(ViewOutput::Submission(form.frame(Instant::now()))).is_ok()
            }
            ViewCommand::Delete(id) => {
                let cleared = projection.clear_error();
                let removed = projection.remove_optimistic(id).is_some();
                if (removed || cleared) && self.emit(ViewOutput::View(projection.frame())).is_err() {
                    return false;
                }

                match self.store.delete(self.user.id, id).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Error deleting bookmark {}: {}", id, e);
                        projection.fail(DELETE_FAILED);
                        self.load(projection, snapshot_tx);
                        self.emit(ViewOutput::Error {
                            code: "DELETE_FAILED".to_string(),
                            message: DELETE_FAILED.to_string(),
                        })
                        .and_then(|_| self.emit(ViewOutput::View(projection.frame())))
                        .is_ok()
                    }
                }
            }
            ViewCommand::Ping => self.emit(ViewOutput::Pong).is_ok(),
        }
    }

    /// Starts a snapshot query. Events applied until it lands are replayed
    /// over its result.
    fn load(&self, projection: &mut Projection, snapshot_tx: &mpsc::UnboundedSender<SnapshotResult>) {
        projection.begin_load();
        let store = self.store.clone();
        let user_id = self.user.id;
        let snapshot_tx = snapshot_tx.clone();

        tokio::spawn(async move {
            let result = store.list_for_user(user_id).await;
            // The view may already be gone.
            let _ = snapshot_tx.send(result);
        });
    }

    fn emit(&self, output: ViewOutput) -> std::result::Result<(), ()> {
        self.output.send(output).map_err(|_| {
            debug!("Live view output closed for user {}", self.user.id);
        })
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
