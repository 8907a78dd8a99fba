use crate::{error::Result, models::realtime::ChangeEvent};
use dashmap::DashMap;
use std::{future::Future, sync::Arc};
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 变更事件广播通道
#[derive(Debug, Clone)]
enum FeedEnvelope {
    Change { user_id: Uuid, event: ChangeEvent },
    /// Upstream may have lost changes; every subscriber must refetch.
    Resync,
}

/// 订阅者收到的信号
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Event(ChangeEvent),
    /// This many envelopes were dropped (zero when the producer lost an
    /// unknown number upstream); refetch.
    Lagged(u64),
}

#[derive(Debug, Clone)]
struct SubscriptionInfo {
    user_id: Uuid,
}

/// 按用户过滤的变更推送中心
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<FeedEnvelope>,
    subscriptions: Arc<DashMap<Uuid, SubscriptionInfo>>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            subscriptions: Arc::new(DashMap::new()),
        }
    }

    /// 发布变更事件，返回收到事件的接收者数量
    pub fn publish(&self, user_id: Uuid, event: ChangeEvent) -> usize {
        debug!("Publishing {:?} change for record {} (user {})", kind(&event), event.record_id(), user_id);

        match self.tx.send(FeedEnvelope::Change { user_id, event }) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No active subscribers for change feed");
                0
            }
        }
    }

    /// Tells every subscriber that changes may have been missed, so their
    /// views reload from the store.
    pub fn resync(&self) -> usize {
        warn!("Change feed resync requested for all subscribers");
        self.tx.send(FeedEnvelope::Resync).unwrap_or(0)
    }

    /// 为单个用户打开订阅，注册立即生效
    pub fn subscribe(&self, user_id: Uuid) -> Subscription {
        let id = Uuid::new_v4();
        self.subscriptions.insert(id, SubscriptionInfo { user_id });

        debug!("Opened change feed subscription {} for user {}", id, user_id);

        Subscription {
            id,
            user_id,
            rx: self.tx.subscribe(),
            registry: self.subscriptions.clone(),
            released: false,
        }
    }

    /// 回调式订阅
    ///
    /// Identity resolution runs in the background. When it yields no user,
    /// or fails, nothing is subscribed and the returned teardown is inert.
    /// Tearing down before setup finishes is allowed: the subscription is
    /// released as soon as it exists.
    pub fn subscribe_with<I, F>(&self, identity: I, mut on_event: F) -> Teardown
    where
        I: Future<Output = Result<Option<Uuid>>> + Send + 'static,
        F: FnMut(FeedSignal) + Send + 'static,
    {
        let feed = self.clone();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let user_id = match identity.await {
                Ok(Some(user_id)) => user_id,
                Ok(None) => {
                    debug!("No authenticated user, change feed subscription skipped");
                    return;
                }
                Err(e) => {
                    warn!("Identity resolution failed, change feed subscription skipped: {}", e);
                    return;
                }
            };

            let mut subscription = feed.subscribe(user_id);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    signal = subscription.recv() => match signal {
                        Some(signal) => on_event(signal),
                        None => break,
                    },
                }
            }

            subscription.unsubscribe();
        });

        Teardown {
            cancel: Some(cancel_tx),
            task: Some(task),
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscriptions_for_user(&self, user_id: Uuid) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn kind(event: &ChangeEvent) -> &'static str {
    match event {
        ChangeEvent::Inserted(_) => "insert",
        ChangeEvent::Updated(_) => "update",
        ChangeEvent::Deleted(_) => "delete",
    }
}

/// 单个视图持有的订阅句柄
pub struct Subscription {
    id: Uuid,
    user_id: Uuid,
    rx: broadcast::Receiver<FeedEnvelope>,
    registry: Arc<DashMap<Uuid, SubscriptionInfo>>,
    released: bool,
}

impl Subscription {
    /// Next event for this user; `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<FeedSignal> {
        loop {
            match self.rx.recv().await {
                Ok(FeedEnvelope::Change { user_id, event }) if user_id == self.user_id => {
                    return Some(FeedSignal::Event(event));
                }
                Ok(FeedEnvelope::Change { .. }) => continue,
                Ok(FeedEnvelope::Resync) => {
                    debug!("Subscription {} told to resync", self.id);
                    return Some(FeedSignal::Lagged(0));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscription {} lagged by {} events", self.id, skipped);
                    return Some(FeedSignal::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.remove(&self.id);
        debug!("Released change feed subscription {} for user {}", self.id, self.user_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// 回调式订阅的释放句柄
pub struct Teardown {
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Teardown {
    /// Registers the intent to unsubscribe without waiting for setup.
    pub fn teardown(mut self) {
        self.signal();
    }

    /// Like [`Teardown::teardown`], then waits until the subscription is gone.
    pub async fn teardown_and_wait(mut self) {
        self.signal();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Change feed subscriber task ended abnormally: {}", e);
            }
        }
    }

    fn signal(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
            info!("Change feed teardown requested");
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::bookmark::Bookmark;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn bookmark(user_id: Uuid) -> Bookmark {
        Bookmark {
            id: Uuid::new_v4(),
            user_id,
            url: "https://example.com".to_string(),
            title: "Example".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscription_only_sees_own_user() {
        let feed = ChangeFeed::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut subscription = feed.subscribe(alice);

        let bobs = bookmark(bob);
        let alices = bookmark(alice);
        feed.publish(bob, ChangeEvent::Inserted(bobs));
        feed.publish(alice, ChangeEvent::Inserted(alices.clone()));

        assert_eq!(
            subscription.recv().await,
            Some(FeedSignal::Event(ChangeEvent::Inserted(alices)))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_exactly_once() {
        let feed = ChangeFeed::new(16);
        let user = Uuid::new_v4();
        let subscription = feed.subscribe(user);
        let _other = feed.subscribe(user);
        assert_eq!(feed.subscriptions_for_user(user), 2);

        subscription.unsubscribe();
        assert_eq!(feed.subscriptions_for_user(user), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let feed = ChangeFeed::new(16);
        {
            let _subscription = feed.subscribe(Uuid::new_v4());
            assert_eq!(feed.active_subscriptions(), 1);
        }
        assert_eq!(feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver_is_told_to_refetch() {
        let feed = ChangeFeed::new(2);
        let user = Uuid::new_v4();
        let mut subscription = feed.subscribe(user);

        for _ in 0..5 {
            feed.publish(user, ChangeEvent::Deleted(Uuid::new_v4()));
        }

        assert!(matches!(subscription.recv().await, Some(FeedSignal::Lagged(_))));
    }

    #[tokio::test]
    async fn test_resync_reaches_every_user_as_lag() {
        let feed = ChangeFeed::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut alices = feed.subscribe(alice);
        let mut bobs = feed.subscribe(bob);

        assert_eq!(feed.resync(), 2);
        assert_eq!(alices.recv().await, Some(FeedSignal::Lagged(0)));
        assert_eq!(bobs.recv().await, Some(FeedSignal::Lagged(0)));

        // Ordinary events keep flowing afterwards.
        let id = Uuid::new_v4();
        feed.publish(alice, ChangeEvent::Deleted(id));
        assert_eq!(alices.recv().await, Some(FeedSignal::Event(ChangeEvent::Deleted(id))));
    }

    #[tokio::test]
    async fn test_resync_without_subscribers_is_harmless() {
        let feed = ChangeFeed::new(16);
        assert_eq!(feed.resync(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_with_delivers_events() {
        let feed = ChangeFeed::new(16);
        let user = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let teardown = feed.subscribe_with(async move { Ok(Some(user)) }, move |signal| {
            let _ = tx.send(signal);
        });

        while feed.active_subscriptions() == 0 {
            tokio::task::yield_now().await;
        }

        let id = Uuid::new_v4();
        feed.publish(user, ChangeEvent::Deleted(id));
        assert_eq!(rx.recv().await, Some(FeedSignal::Event(ChangeEvent::Deleted(id))));

        teardown.teardown_and_wait().await;
        assert_eq!(feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_without_identity_is_noop() {
        let feed = ChangeFeed::new(16);
        let teardown = feed.subscribe_with(async { Ok(None) }, |_| {});
        teardown.teardown_and_wait().await;
        assert_eq!(feed.active_subscriptions(), 0);

        let teardown = feed.subscribe_with(
            async { Err(crate::error::AppError::unauthorized("no session")) },
            |_| {},
        );
        teardown.teardown_and_wait().await;
        assert_eq!(feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_teardown_during_setup_still_releases() {
        let feed = ChangeFeed::new(16);
        let user = Uuid::new_v4();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let teardown = feed.subscribe_with(
            async move {
                let _ = release_rx.await;
                Ok(Some(user))
            },
            |_| {},
        );

        // Teardown is requested while identity resolution is still pending.
        let waiter = tokio::spawn(teardown.teardown_and_wait());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = release_tx.send(());

        waiter.await.unwrap();
        assert_eq!(feed.active_subscriptions(), 0);
    }
}
