pub mod auth;
pub mod bookmark;
pub mod change_feed;
pub mod database;
pub mod identity;
pub mod live_view;
pub mod reconciler;
pub mod store;
pub mod submission;

// 重新导出常用类型
pub use auth::{SessionService, SessionUser};
pub use bookmark::PgBookmarkStore;
pub use change_feed::ChangeFeed;
pub use database::Database;
pub use identity::IdentityService;
pub use live_view::LiveView;
pub use reconciler::Projection;
pub use store::{BookmarkStore, MemoryBookmarkStore};
pub use submission::SubmissionService;
