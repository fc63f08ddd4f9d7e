use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration as StdDuration,
};

use anyhow::{anyhow, Context, Result};
use broker::{Broker, BrokerEvent, Qos};
use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{DeviceId, Group, GroupId},
    protocol::{LoginResult, Topic, RENEW_PAYLOAD, SKIP_FILTER},
};
use storage::CoordinatorStore;
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

pub mod album;
pub mod mailbox;

use album::AlbumSource;
use mailbox::{RequestStore, SkipCooldown};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Base URL handed to frames for image and QR retrieval.
    pub api_url: String,
    pub tick: StdDuration,
    pub skip_cooldown: Duration,
    pub roster_refresh: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000/api/v1".into(),
            tick: StdDuration::from_secs(2),
            skip_cooldown: Duration::seconds(5),
            roster_refresh: Duration::seconds(60),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub subscribed_devices: usize,
    pub logins_served: usize,
    pub rolled_over: Vec<GroupId>,
    pub renews_published: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.subscribed_devices == 0 && self.logins_served == 0 && self.rolled_over.is_empty()
    }
}

struct RolloverCandidate {
    group: Group,
    skip_requested: bool,
}

#[derive(Default)]
struct RolloverBatch {
    candidates: BTreeMap<GroupId, RolloverCandidate>,
}

#[derive(Default)]
struct CommittedRollovers {
    rolled_over: Vec<GroupId>,
    renews_published: usize,
}

pub struct Coordinator {
    store: Arc<dyn CoordinatorStore>,
    broker: Arc<dyn Broker>,
    albums: Arc<dyn AlbumSource>,
    requests: Arc<RequestStore>,
    settings: CoordinatorSettings,
    skip_cooldown: SkipCooldown,
    connected: bool,
    reconnected: bool,
    subscribed: HashSet<DeviceId>,
    roster_checked_at: Option<DateTime<Utc>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        broker: Arc<dyn Broker>,
        albums: Arc<dyn AlbumSource>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            broker,
            albums,
            requests: Arc::new(RequestStore::default()),
            skip_cooldown: SkipCooldown::new(settings.skip_cooldown),
            settings,
            connected: false,
            reconnected: false,
            subscribed: HashSet::new(),
            roster_checked_at: None,
        }
    }

    pub fn requests(&self) -> Arc<RequestStore> {
        Arc::clone(&self.requests)
    }

    pub fn handle_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                info!("broker connected; device subscriptions will be re-established");
                self.connected = true;
                self.reconnected = true;
                self.subscribed.clear();
            }
            BrokerEvent::Disconnected => {
                warn!("broker disconnected");
                self.connected = false;
            }
            BrokerEvent::Message { topic, payload } => {
                match self.requests.record_message(&topic, &payload) {
                    Ok(()) => debug!(%topic, "recorded inbound request"),
                    Err(error) => warn!(%topic, %error, "ignoring malformed inbound message"),
                }
            }
        }
    }

    /// Drives ticks until `shutdown` flips to `true` (or its sender is
    /// dropped). A tick that has started always runs to completion.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<BrokerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_ms = self.settings.tick.as_millis() as u64, "coordinator loop started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("coordinator loop stopping");
                        return Ok(());
                    }
                }

                _ = ticker.tick() => {
                    let report = self.run_tick(Utc::now()).await;
                    if !report.is_idle() {
                        info!(
                            subscribed = report.subscribed_devices,
                            logins = report.logins_served,
                            rollovers = report.rolled_over.len(),
                            renews = report.renews_published,
                            "tick complete"
                        );
                    }
                }

                event = events.recv() => match event {
                    Some(event) => self.handle_broker_event(event),
                    None => return Err(anyhow!("broker event stream closed")),
                },
            }
        }
    }

    /// One pass of every phase. A failing phase is logged and the remaining
    /// phases still run.
    pub async fn run_tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self.resubscribe(now).await {
            Ok(count) => report.subscribed_devices = count,
            Err(error) => warn!(%error, "resubscription incomplete; retrying next tick"),
        }

        match self.serve_logins(now).await {
            Ok(count) => report.logins_served = count,
            Err(error) => warn!(%error, "login batch failed"),
        }

        let mut batch = RolloverBatch::default();
        if let Err(error) = self.collect_timeouts(now, &mut batch).await {
            warn!(%error, "rollover timeout check failed");
        }
        if let Err(error) = self.collect_skips(now, &mut batch).await {
            warn!(%error, "skip requests could not be evaluated");
        }

        match self.commit_rollovers(now, batch).await {
            Ok(committed) => {
                report.rolled_over = committed.rolled_over;
                report.renews_published = committed.renews_published;
            }
            Err(error) => error!(%error, "rollover batch not committed; no renew sent"),
        }

        report
    }

    async fn resubscribe(&mut self, now: DateTime<Utc>) -> Result<usize> {
        if !self.connected {
            return Ok(0);
        }
        let roster_due = self
            .roster_checked_at
            .map_or(true, |checked| now - checked >= self.settings.roster_refresh);
        if !self.reconnected && !roster_due {
            return Ok(0);
        }

        if self.reconnected {
            self.broker
                .subscribe(SKIP_FILTER)
                .await
                .context("failed to subscribe to skip requests")?;
        }

        let devices = self.store.list_devices().await?;
        self.roster_checked_at = Some(now);

        let mut added = 0;
        for device in devices {
            if self.subscribed.contains(&device.id) {
                continue;
            }
            let topic = Topic::DeviceBeacon(device.id.clone()).to_string();
            self.broker
                .subscribe(&topic)
                .await
                .with_context(|| format!("failed to subscribe to {topic}"))?;
            debug!(%topic, "subscribed to device beacon");
            self.subscribed.insert(device.id);
            added += 1;
        }

        self.reconnected = false;
        Ok(added)
    }

    async fn serve_logins(&self, now: DateTime<Utc>) -> Result<usize> {
        let device_ids = self.requests.logins.drain_all();
        if device_ids.is_empty() {
            return Ok(0);
        }

        let grants = match self.store.record_logins(&device_ids, now).await {
            Ok(grants) => grants,
            Err(error) => {
                self.requests.logins.record_all(device_ids);
                return Err(error);
            }
        };

        let mut served = 0;
        for grant in grants {
            let topic = Topic::LoginResult(grant.device_id.clone()).to_string();
            let payload = LoginResult {
                groupid: grant.group_id,
                api_url: self.settings.api_url.clone(),
            }
            .to_payload();
            match self.broker.publish(&topic, payload, Qos::AtMostOnce).await {
                Ok(()) => {
                    info!(device_id = %grant.device_id, group_id = %grant.group_id, "served login");
                    served += 1;
                }
                Err(error) => warn!(device_id = %grant.device_id, %error, "login result publish failed"),
            }
        }
        Ok(served)
    }

    async fn collect_timeouts(&self, now: DateTime<Utc>, batch: &mut RolloverBatch) -> Result<()> {
        for group in self.store.list_groups().await? {
            if group.rollover_due(now) {
                debug!(group_id = %group.id, "rollover delay elapsed");
                batch.candidates.insert(
                    group.id,
                    RolloverCandidate {
                        group,
                        skip_requested: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn collect_skips(&self, now: DateTime<Utc>, batch: &mut RolloverBatch) -> Result<()> {
        let group_ids = self.requests.skips.drain_all();
        for (index, group_id) in group_ids.iter().copied().enumerate() {
            if let Some(candidate) = batch.candidates.get_mut(&group_id) {
                if self.skip_cooldown.admits(&candidate.group, now) {
                    candidate.group.last_skip_request = now;
                    candidate.skip_requested = true;
                }
                continue;
            }

            let group = match self.store.get_group(group_id).await {
                Ok(Some(group)) => group,
                Ok(None) => {
                    debug!(%group_id, "skip request for unknown group");
                    continue;
                }
                Err(error) => {
                    self.requests
                        .skips
                        .record_all(group_ids[index..].iter().copied());
                    return Err(error);
                }
            };

            if !self.skip_cooldown.admits(&group, now) {
                debug!(%group_id, "skip suppressed by cooldown");
                continue;
            }

            let mut group = group;
            group.last_skip_request = now;
            batch.candidates.insert(
                group_id,
                RolloverCandidate {
                    group,
                    skip_requested: true,
                },
            );
        }
        Ok(())
    }

    async fn commit_rollovers(
        &self,
        now: DateTime<Utc>,
        batch: RolloverBatch,
    ) -> Result<CommittedRollovers> {
        let mut changed = Vec::with_capacity(batch.candidates.len());
        let mut skip_triggered = Vec::new();

        for (group_id, candidate) in batch.candidates {
            let RolloverCandidate {
                mut group,
                skip_requested,
            } = candidate;
            let album_size = match self.albums.asset_count(&group.album_id).await {
                Ok(size) => size,
                Err(error) => {
                    warn!(%group_id, album_id = %group.album_id, %error, "album size lookup failed; keeping current asset");
                    if skip_requested {
                        self.requests.skips.record(group_id);
                    }
                    continue;
                }
            };

            match group.roll_over(album_size, now) {
                Some(outcome) => {
                    info!(
                        %group_id,
                        position = outcome.position,
                        reseeded = outcome.reseeded,
                        skip = skip_requested,
                        "rolling over group"
                    );
                    if skip_requested {
                        skip_triggered.push(group_id);
                    }
                    changed.push(group);
                }
                None => warn!(%group_id, album_id = %group.album_id, "album is empty; nothing to roll over"),
            }
        }

        if changed.is_empty() {
            return Ok(CommittedRollovers::default());
        }

        if let Err(error) = self.store.save_groups(&changed).await {
            self.requests.skips.record_all(skip_triggered);
            return Err(error.context("failed to persist rollover batch"));
        }

        let mut committed = CommittedRollovers::default();
        for group in changed {
            committed.rolled_over.push(group.id);
            let topic = Topic::GroupRenew(group.id).to_string();
            match self
                .broker
                .publish(&topic, RENEW_PAYLOAD.to_vec(), Qos::AtLeastOnce)
                .await
            {
                Ok(()) => committed.renews_published += 1,
                Err(error) => warn!(group_id = %group.id, %error, "renew publish failed"),
            }
        }
        Ok(committed)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
