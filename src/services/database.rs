use crate::{
    config::Config,
    error::Result,
    models::realtime::ChangeNotification,
    services::change_feed::ChangeFeed,
};
use sqlx::{
    postgres::{PgListener, PgPoolOptions},
    PgPool,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 触发器使用的通知通道
pub const CHANGE_CHANNEL: &str = "bookmark_changes";

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// 数据库服务
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
    pub config: Config,
}

impl Database {
    /// 创建新的数据库实例
    pub async fn new(config: &Config) -> Result<Self> {
        info!("Initializing database connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await?;

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    /// 验证数据库连接
    pub async fn verify_connection(&self) -> Result<()> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                info!("Database connection verified successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to verify database connection: {}", e);
                Err(e.into())
            }
        }
    }

    /// 执行数据库迁移
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Relays trigger notifications into the change feed until the task is
    /// aborted. A dropped listener connection is re-established after a
    /// short delay. Notifications sent while disconnected are lost, so every
    /// (re)connect tells subscribers to resync.
    pub fn listen_for_changes(&self, feed: ChangeFeed) -> JoinHandle<()> {
        let pool = self.pool.clone();

        tokio::spawn(async move {
            loop {
                match relay_notifications(&pool, &feed).await {
                    Ok(()) => warn!("Change listener stopped, reconnecting"),
                    Err(e) => error!("Change listener failed: {}", e),
                }
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
            }
        })
    }
}

async fn relay_notifications(pool: &PgPool, feed: &ChangeFeed) -> Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    info!("Listening for bookmark changes on channel {}", CHANGE_CHANNEL);

    // Anything committed while no listener was attached went unseen.
    feed.resync();

    loop {
        // `Ok(None)`: the connection dropped and the next call reconnects.
        let notification = listener.try_recv().await?;
        relay_payload(feed, notification.as_ref().map(|n| n.payload()));
    }
}

/// Publishes one trigger payload, or asks for a resync when the listener
/// lost its connection (`None`).
fn relay_payload(feed: &ChangeFeed, payload: Option<&str>) {
    let Some(payload) = payload else {
        warn!("Change listener connection lost, notifications may have been missed");
        feed.resync();
        return;
    };

    let parsed: ChangeNotification = match serde_json::from_str(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Ignoring malformed change notification: {}", e);
            return;
        }
    };

    match parsed.into_event() {
        Some((user_id, event)) => {
            feed.publish(user_id, event);
        }
        None => debug!("Ignoring change notification without a usable record"),
    }
}
