use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use broker::{MemoryBroker, MemoryClient};
use chrono::TimeZone;
use shared::domain::Device;
use storage::{LoginGrant, NewGroup, Storage};

use super::*;
use crate::album::AlbumError;

struct StaticAlbums {
    size: AtomicUsize,
    failing: AtomicBool,
}

impl StaticAlbums {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size: AtomicUsize::new(size),
            failing: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl AlbumSource for StaticAlbums {
    async fn asset_count(&self, album_id: &str) -> Result<usize, AlbumError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AlbumError::NotFound(album_id.to_string()));
        }
        Ok(self.size.load(Ordering::SeqCst))
    }

    async fn asset_ids(&self, _album_id: &str) -> Result<Vec<String>, AlbumError> {
        let size = self.size.load(Ordering::SeqCst);
        Ok((0..size).map(|i| format!("asset-{i}")).collect())
    }
}

/// Delegates to SQLite but can be told to fail batch commits.
struct FlakyStore {
    inner: Storage,
    fail_saves: AtomicBool,
}

#[async_trait]
impl CoordinatorStore for FlakyStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.inner.list_devices().await
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        self.inner.list_groups().await
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Option<Group>> {
        self.inner.get_group(group_id).await
    }

    async fn save_groups(&self, groups: &[Group]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.inner.save_groups(groups).await
    }

    async fn record_logins(
        &self,
        device_ids: &[DeviceId],
        at: DateTime<Utc>,
    ) -> Result<Vec<LoginGrant>> {
        self.inner.record_logins(device_ids, at).await
    }
}

struct Harness {
    storage: Storage,
    store: Arc<FlakyStore>,
    broker: MemoryBroker,
    albums: Arc<StaticAlbums>,
    coordinator: Coordinator,
    coordinator_events: mpsc::Receiver<BrokerEvent>,
    frame: MemoryClient,
}

impl Harness {
    async fn new(album_size: usize) -> Self {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let store = Arc::new(FlakyStore {
            inner: storage.clone(),
            fail_saves: AtomicBool::new(false),
        });
        let broker = MemoryBroker::new();
        let (client, coordinator_events) = broker.connect("coordinator");
        let (frame, _frame_events) = broker.connect("frame");
        let albums = StaticAlbums::new(album_size);
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(client),
            albums.clone(),
            CoordinatorSettings {
                api_url: "http://frames.local/api/v1".into(),
                ..CoordinatorSettings::default()
            },
        );
        let mut harness = Self {
            storage,
            store,
            broker,
            albums,
            coordinator,
            coordinator_events,
            frame,
        };
        harness.deliver();
        harness
    }

    /// Hands every queued broker event to the coordinator.
    fn deliver(&mut self) {
        while let Ok(event) = self.coordinator_events.try_recv() {
            self.coordinator.handle_broker_event(event);
        }
    }

    async fn group(&self, name: &str, delay_minutes: i64, created_at: DateTime<Utc>) -> GroupId {
        self.storage
            .create_group(
                &NewGroup {
                    name: name.into(),
                    album_url: format!("https://photos.example/share/{name}"),
                    album_id: format!("album-{name}"),
                    rollover_delay_minutes: delay_minutes,
                    random_seed: 42,
                },
                created_at,
            )
            .await
            .expect("group")
    }

    async fn reload(&self, group_id: GroupId) -> Group {
        self.storage
            .get_group(group_id)
            .await
            .expect("load")
            .expect("exists")
    }

    async fn skip_from_frame(&mut self, group_id: GroupId) {
        self.frame
            .publish(
                &Topic::Skip(group_id).to_string(),
                b"SKIP".to_vec(),
                Qos::AtMostOnce,
            )
            .await
            .expect("publish skip");
        self.deliver();
    }

    fn renews(&self, group_id: GroupId) -> usize {
        self.broker
            .published_to(&Topic::GroupRenew(group_id).to_string())
            .len()
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn device(raw: &str) -> DeviceId {
    DeviceId::parse(raw).expect("device id")
}

#[tokio::test]
async fn subscribes_known_devices_after_connect_and_again_after_reconnect() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    h.storage
        .register_device(&device("D1"), None, None)
        .await
        .expect("D1");
    h.storage
        .register_device(&device("D2"), None, None)
        .await
        .expect("D2");

    let report = h.coordinator.run_tick(now).await;
    assert_eq!(report.subscribed_devices, 2);
    let subscriptions = h.broker.subscriptions("coordinator");
    assert!(subscriptions.contains(&"portrait/skip/+".to_string()));
    assert!(subscriptions.contains(&"portrait/device/D1".to_string()));
    assert!(subscriptions.contains(&"portrait/device/D2".to_string()));

    let report = h.coordinator.run_tick(now + Duration::seconds(2)).await;
    assert_eq!(report.subscribed_devices, 0);

    h.broker.reconnect_all();
    h.deliver();
    assert!(h.broker.subscriptions("coordinator").is_empty());

    let report = h.coordinator.run_tick(now + Duration::seconds(4)).await;
    assert_eq!(report.subscribed_devices, 2);
    assert_eq!(h.broker.subscriptions("coordinator").len(), 3);
}

#[tokio::test]
async fn roster_refresh_subscribes_devices_provisioned_later() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    h.coordinator.run_tick(now).await;

    h.storage
        .register_device(&device("late"), None, None)
        .await
        .expect("late");
    let report = h.coordinator.run_tick(now + Duration::seconds(10)).await;
    assert_eq!(report.subscribed_devices, 0);

    let report = h.coordinator.run_tick(now + Duration::seconds(61)).await;
    assert_eq!(report.subscribed_devices, 1);
    assert!(h
        .broker
        .subscriptions("coordinator")
        .contains(&"portrait/device/late".to_string()));
}

#[tokio::test]
async fn no_subscriptions_while_disconnected() {
    let mut h = Harness::new(5).await;
    h.storage
        .register_device(&device("D1"), None, None)
        .await
        .expect("D1");
    h.coordinator.handle_broker_event(BrokerEvent::Disconnected);

    let report = h.coordinator.run_tick(base_time()).await;
    assert_eq!(report.subscribed_devices, 0);
    assert!(h.broker.subscriptions("coordinator").is_empty());
}

#[tokio::test]
async fn login_is_served_once_after_device_is_provisioned() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let requests = h.coordinator.requests();

    // Unprovisioned: beacons are dropped without a reply.
    requests.logins.record(device("D1"));
    let report = h.coordinator.run_tick(now).await;
    assert_eq!(report.logins_served, 0);
    assert!(h.broker.published_to("portrait/login/D1").is_empty());

    let group_id = h.group("family", 5, now).await;
    h.storage
        .register_device(&device("D1"), Some(group_id), None)
        .await
        .expect("D1");

    for _ in 0..3 {
        requests.logins.record(device("D1"));
    }
    let report = h.coordinator.run_tick(now + Duration::seconds(5)).await;
    assert_eq!(report.logins_served, 1);

    let replies = h.broker.published_to("portrait/login/D1");
    assert_eq!(replies.len(), 1);
    let reply = LoginResult::from_payload(&replies[0]).expect("login result");
    assert_eq!(reply.groupid, group_id);
    assert_eq!(reply.api_url, "http://frames.local/api/v1");

    let audit = h
        .storage
        .list_login_records(&device("D1"), 10)
        .await
        .expect("audit");
    assert_eq!(audit.len(), 1);

    let report = h.coordinator.run_tick(now + Duration::seconds(7)).await;
    assert_eq!(report.logins_served, 0);
    assert_eq!(h.broker.published_to("portrait/login/D1").len(), 1);
}

#[tokio::test]
async fn beacon_over_the_broker_reaches_the_login_mailbox() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let group_id = h.group("family", 5, now).await;
    h.storage
        .register_device(&device("D1"), Some(group_id), None)
        .await
        .expect("D1");
    h.coordinator.run_tick(now).await;

    h.frame
        .publish("portrait/device/D1", b"LOGIN".to_vec(), Qos::AtMostOnce)
        .await
        .expect("beacon");
    h.deliver();

    let report = h.coordinator.run_tick(now + Duration::seconds(2)).await;
    assert_eq!(report.logins_served, 1);
}

#[tokio::test]
async fn overdue_group_rolls_over_exactly_once() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let g2 = h.group("G2", 2, now - Duration::minutes(3)).await;

    let report = h.coordinator.run_tick(now).await;
    assert_eq!(report.rolled_over, vec![g2]);
    assert_eq!(report.renews_published, 1);
    assert_eq!(h.renews(g2), 1);

    let stored = h.reload(g2).await;
    assert_eq!(stored.current_asset, 1);
    assert_eq!(stored.last_rollover, now);

    let report = h.coordinator.run_tick(now).await;
    assert!(report.rolled_over.is_empty());
    assert_eq!(h.renews(g2), 1);
}

#[tokio::test]
async fn group_within_delay_is_left_alone() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let group_id = h.group("calm", 2, now - Duration::minutes(1)).await;

    let report = h.coordinator.run_tick(now).await;
    assert!(report.rolled_over.is_empty());
    assert_eq!(h.reload(group_id).await.current_asset, 0);
}

#[tokio::test]
async fn skip_cooldown_limits_rollovers() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let g3 = h.group("G3", 24 * 60, now - Duration::hours(1)).await;
    h.coordinator.run_tick(now - Duration::seconds(2)).await;

    h.skip_from_frame(g3).await;
    let report = h.coordinator.run_tick(now).await;
    assert_eq!(report.rolled_over, vec![g3]);

    h.skip_from_frame(g3).await;
    let report = h.coordinator.run_tick(now + Duration::seconds(2)).await;
    assert!(report.rolled_over.is_empty(), "second skip is inside the cooldown");

    h.skip_from_frame(g3).await;
    let report = h.coordinator.run_tick(now + Duration::seconds(6)).await;
    assert_eq!(report.rolled_over, vec![g3]);

    assert_eq!(h.renews(g3), 2);
    let stored = h.reload(g3).await;
    assert_eq!(stored.current_asset, 2);
    assert_eq!(stored.last_skip_request, now + Duration::seconds(6));
}

#[tokio::test]
async fn skips_between_ticks_coalesce() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let g3 = h.group("G3", 24 * 60, now - Duration::hours(1)).await;
    h.coordinator.run_tick(now - Duration::seconds(2)).await;

    h.skip_from_frame(g3).await;
    h.skip_from_frame(g3).await;
    let report = h.coordinator.run_tick(now).await;
    assert_eq!(report.rolled_over, vec![g3]);
    assert_eq!(h.renews(g3), 1);
    assert_eq!(h.reload(g3).await.current_asset, 1);
}

#[tokio::test]
async fn timeout_and_skip_in_one_tick_roll_over_once() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let group_id = h.group("both", 2, now - Duration::minutes(3)).await;

    h.coordinator.requests().skips.record(group_id);
    let report = h.coordinator.run_tick(now).await;
    assert_eq!(report.rolled_over, vec![group_id]);
    assert_eq!(h.renews(group_id), 1);

    let stored = h.reload(group_id).await;
    assert_eq!(stored.current_asset, 1);
    assert_eq!(stored.last_skip_request, now);
}

#[tokio::test]
async fn skip_for_unknown_group_is_dropped() {
    let mut h = Harness::new(5).await;
    h.coordinator.requests().skips.record(GroupId(404));
    let report = h.coordinator.run_tick(base_time()).await;
    assert!(report.rolled_over.is_empty());
    assert!(h.coordinator.requests().skips.is_empty());
}

#[tokio::test]
async fn malformed_messages_are_ignored() {
    let mut h = Harness::new(5).await;
    for (topic, payload) in [
        ("portrait/skip/not-a-number", &b"SKIP"[..]),
        ("portrait/device/D1", &b"HELLO"[..]),
        ("elsewhere/skip/1", &b"SKIP"[..]),
        ("portrait/group/1", &b"RENEW"[..]),
    ] {
        h.coordinator.handle_broker_event(BrokerEvent::Message {
            topic: topic.into(),
            payload: payload.to_vec(),
        });
    }
    let requests = h.coordinator.requests();
    assert!(requests.logins.is_empty());
    assert!(requests.skips.is_empty());
}

#[tokio::test]
async fn failed_commit_sends_no_renew_and_retries_next_tick() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let overdue = h.group("overdue", 2, now - Duration::minutes(3)).await;
    let skipped = h.group("skipped", 24 * 60, now - Duration::hours(1)).await;
    h.coordinator.requests().skips.record(skipped);

    h.store.fail_saves.store(true, Ordering::SeqCst);
    let report = h.coordinator.run_tick(now).await;
    assert!(report.rolled_over.is_empty());
    assert_eq!(report.renews_published, 0);
    assert!(h.broker.published().iter().all(|p| !p.topic.starts_with("portrait/group/")));
    assert_eq!(h.reload(overdue).await.current_asset, 0);
    assert_eq!(h.reload(skipped).await.current_asset, 0);

    h.store.fail_saves.store(false, Ordering::SeqCst);
    let report = h.coordinator.run_tick(now + Duration::seconds(2)).await;
    assert_eq!(report.rolled_over, vec![overdue, skipped]);
    assert_eq!(h.renews(overdue), 1);
    assert_eq!(h.renews(skipped), 1);
}

#[tokio::test]
async fn album_lookup_failure_keeps_position_and_seed() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let group_id = h.group("offline", 2, now - Duration::minutes(3)).await;
    let before = h.reload(group_id).await;

    h.albums.failing.store(true, Ordering::SeqCst);
    let report = h.coordinator.run_tick(now).await;
    assert!(report.rolled_over.is_empty());
    assert_eq!(h.reload(group_id).await, before);
    assert_eq!(h.renews(group_id), 0);

    h.albums.failing.store(false, Ordering::SeqCst);
    let report = h.coordinator.run_tick(now + Duration::seconds(2)).await;
    assert_eq!(report.rolled_over, vec![group_id]);
}

#[tokio::test]
async fn empty_album_is_not_rolled_over() {
    let mut h = Harness::new(0).await;
    let now = base_time();
    let group_id = h.group("empty", 2, now - Duration::minutes(3)).await;

    let report = h.coordinator.run_tick(now).await;
    assert!(report.rolled_over.is_empty());
    assert_eq!(h.renews(group_id), 0);
}

#[tokio::test]
async fn wrapping_past_album_end_reseeds() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let group_id = h.group("G1", 2, now - Duration::minutes(3)).await;
    let mut group = h.reload(group_id).await;
    group.current_asset = 4;
    h.storage.save_groups(&[group]).await.expect("save");

    h.coordinator.run_tick(now).await;
    let stored = h.reload(group_id).await;
    assert_eq!(stored.current_asset, 0);
    assert_ne!(stored.random_seed, 42);
}

#[tokio::test]
async fn renew_publish_failure_does_not_undo_commit() {
    let mut h = Harness::new(5).await;
    let now = base_time();
    let group_id = h.group("quiet", 2, now - Duration::minutes(3)).await;

    h.broker.set_fail_publishes(true);
    let report = h.coordinator.run_tick(now).await;
    assert_eq!(report.rolled_over, vec![group_id]);
    assert_eq!(report.renews_published, 0);
    assert_eq!(h.reload(group_id).await.current_asset, 1);
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let h = Harness::new(5).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_events_tx, events_rx) = mpsc::channel(8);
    let handle = tokio::spawn(h.coordinator.run(events_rx, shutdown_rx));

    shutdown_tx.send(true).expect("signal shutdown");
    let result = tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("loop exits")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn run_loop_fails_when_broker_stream_closes() {
    let h = Harness::new(5).await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(8);
    drop(events_tx);

    let result = tokio::time::timeout(
        StdDuration::from_secs(5),
        h.coordinator.run(events_rx, shutdown_rx),
    )
    .await
    .expect("loop exits");
    assert!(result.is_err());
}
