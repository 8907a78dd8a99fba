use smart_bookmarks::{
    build_router,
    config::{Config, StoreBackend},
    services::{ChangeFeed, Database, MemoryBookmarkStore, PgBookmarkStore},
    services::store::BookmarkStore,
    state::AppState,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const FEED_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 初始化日志
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "smart_bookmarks=debug,tower_http=debug".into()),
    );
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Smart Bookmarks service...");

    // 加载配置
    let config = Config::from_env()?;

    let feed = ChangeFeed::new(FEED_CAPACITY);
    let (store, listener) = build_store(&config, &feed).await?;

    let app_state = Arc::new(AppState::new(config.clone(), store, feed)?);
    let app = build_router(app_state);

    // 启动主服务器
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    info!("Starting server on http://{}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(listener) = listener {
        listener.abort();
    }
    info!("Server stopped");

    Ok(())
}

async fn build_store(
    config: &Config,
    feed: &ChangeFeed,
) -> anyhow::Result<(Arc<dyn BookmarkStore>, Option<JoinHandle<()>>)> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let db = Arc::new(Database::new(config).await?);
            db.verify_connection().await?;
            db.migrate().await?;
            info!("Database connection established successfully");

            let listener = db.listen_for_changes(feed.clone());
            Ok((Arc::new(PgBookmarkStore::new(db)), Some(listener)))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; bookmarks are lost on restart");
            Ok((Arc::new(MemoryBookmarkStore::with_feed(feed.clone())), None))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
