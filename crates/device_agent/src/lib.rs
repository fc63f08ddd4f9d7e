use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use broker::{Broker, BrokerError, BrokerEvent, Qos};
use shared::{
    domain::{DeviceId, GroupId},
    protocol::{LoginResult, Topic, LOGIN_PAYLOAD, RENEW_PAYLOAD, SKIP_PAYLOAD},
};
use tokio::{
    sync::{
        mpsc::{self, error::TryRecvError},
        watch,
    },
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

pub mod identity;

pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    AwaitingNetwork,
    AwaitingLogin,
    LoggedIn { group_id: GroupId, api_url: String },
}

/// Flags shared with the rendering and touch side of the frame.
#[derive(Debug, Clone, Default)]
pub struct FrameSignals {
    refresh_pending: Arc<AtomicBool>,
    skip_requested: Arc<AtomicBool>,
}

impl FrameSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_skip(&self) {
        self.skip_requested.store(true, Ordering::SeqCst);
    }

    pub fn skip_requested(&self) -> bool {
        self.skip_requested.load(Ordering::SeqCst)
    }

    pub fn refresh_pending(&self) -> bool {
        self.refresh_pending.load(Ordering::SeqCst)
    }

    /// Consumes the refresh flag; the renderer calls this once per opportunity.
    pub fn take_refresh(&self) -> bool {
        self.refresh_pending.swap(false, Ordering::SeqCst)
    }

    fn request_refresh(&self) {
        self.refresh_pending.store(true, Ordering::SeqCst);
    }

    fn take_skip(&self) -> bool {
        self.skip_requested.swap(false, Ordering::SeqCst)
    }
}

pub struct DeviceAgent<B> {
    device_id: DeviceId,
    broker: B,
    signals: FrameSignals,
    state: AgentState,
    connected: bool,
    resubscribe: bool,
    last_beacon: Option<Instant>,
    beacon_interval: Duration,
    poll_interval: Duration,
}

impl<B: Broker> DeviceAgent<B> {
    pub fn new(device_id: DeviceId, broker: B, signals: FrameSignals) -> Self {
        Self {
            device_id,
            broker,
            signals,
            state: AgentState::AwaitingNetwork,
            connected: false,
            resubscribe: false,
            last_beacon: None,
            beacon_interval: BEACON_INTERVAL,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_intervals(mut self, beacon: Duration, poll: Duration) -> Self {
        self.beacon_interval = beacon;
        self.poll_interval = poll;
        self
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn signals(&self) -> &FrameSignals {
        &self.signals
    }

    pub async fn handle_event(&mut self, event: BrokerEvent, now: Instant) -> Result<(), BrokerError> {
        match event {
            BrokerEvent::Connected => {
                info!(device_id = %self.device_id, "network up");
                self.connected = true;
                self.resubscribe = true;
                if self.state == AgentState::AwaitingNetwork {
                    self.state = AgentState::AwaitingLogin;
                }
                if self.state == AgentState::AwaitingLogin {
                    // Beacon right away instead of waiting out the interval.
                    self.last_beacon = None;
                }
                self.poll(now).await
            }
            BrokerEvent::Disconnected => {
                warn!(device_id = %self.device_id, "network lost");
                self.connected = false;
                Ok(())
            }
            BrokerEvent::Message { topic, payload } => self.handle_message(&topic, &payload).await,
        }
    }

    async fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let parsed = match Topic::parse(topic) {
            Ok(parsed) => parsed,
            Err(error) => {
                debug!(%topic, %error, "ignoring message outside the portrait namespace");
                return Ok(());
            }
        };

        match parsed {
            Topic::LoginResult(target) if target == self.device_id => match self.state {
                AgentState::AwaitingLogin => self.accept_login(payload).await?,
                _ => debug!("not awaiting login; ignoring login result"),
            },
            Topic::GroupRenew(renewed) => match self.state {
                AgentState::LoggedIn { group_id, .. } if group_id == renewed => {
                    if payload == RENEW_PAYLOAD {
                        debug!(%group_id, "renew received");
                        self.signals.request_refresh();
                    } else {
                        warn!(%group_id, "unexpected payload on renew topic");
                    }
                }
                _ => debug!(group_id = %renewed, "renew for another group"),
            },
            other => debug!(topic = %other, "ignoring message"),
        }
        Ok(())
    }

    async fn accept_login(&mut self, payload: &[u8]) -> Result<(), BrokerError> {
        let result = match LoginResult::from_payload(payload) {
            Ok(result) => result,
            Err(error) => {
                warn!(%error, "ignoring malformed login result");
                return Ok(());
            }
        };
        self.broker
            .subscribe(&Topic::GroupRenew(result.groupid).to_string())
            .await?;
        info!(group_id = %result.groupid, api_url = %result.api_url, "logged in");
        self.state = AgentState::LoggedIn {
            group_id: result.groupid,
            api_url: result.api_url,
        };
        self.signals.request_refresh();
        Ok(())
    }

    /// Outbound half of one loop iteration: pending resubscriptions, the login
    /// beacon while unanswered, and a pending skip gesture.
    pub async fn poll(&mut self, now: Instant) -> Result<(), BrokerError> {
        if !self.connected {
            return Ok(());
        }
        if self.resubscribe {
            self.subscribe_current().await?;
            self.resubscribe = false;
        }

        match &self.state {
            AgentState::AwaitingNetwork => {}
            AgentState::AwaitingLogin => {
                if self.signals.take_skip() {
                    debug!("skip gesture before login; dropped");
                }
                let due = self
                    .last_beacon
                    .map_or(true, |sent| now.duration_since(sent) >= self.beacon_interval);
                if due {
                    self.last_beacon = Some(now);
                    let topic = Topic::DeviceBeacon(self.device_id.clone()).to_string();
                    self.broker
                        .publish(&topic, LOGIN_PAYLOAD.to_vec(), Qos::AtMostOnce)
                        .await?;
                    debug!(%topic, "login beacon sent");
                }
            }
            AgentState::LoggedIn { group_id, .. } => {
                if self.signals.take_skip() {
                    let topic = Topic::Skip(*group_id).to_string();
                    // Fire and forget: the gesture is consumed even if the publish fails.
                    self.broker
                        .publish(&topic, SKIP_PAYLOAD.to_vec(), Qos::AtMostOnce)
                        .await?;
                    info!(%group_id, "skip requested");
                }
            }
        }
        Ok(())
    }

    async fn subscribe_current(&self) -> Result<(), BrokerError> {
        let topic = match &self.state {
            AgentState::AwaitingNetwork => return Ok(()),
            AgentState::AwaitingLogin => Topic::LoginResult(self.device_id.clone()),
            AgentState::LoggedIn { group_id, .. } => Topic::GroupRenew(*group_id),
        };
        self.broker.subscribe(&topic.to_string()).await?;
        debug!(%topic, "subscribed");
        Ok(())
    }

    /// Polls at a fixed period, taking at most one inbound event per
    /// iteration, until `shutdown` flips to `true`.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<BrokerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(device_id = %self.device_id, "device agent stopping");
                        return Ok(());
                    }
                }

                _ = ticker.tick() => {}
            }

            match events.try_recv() {
                Ok(event) => {
                    if let Err(error) = self.handle_event(event, Instant::now()).await {
                        warn!(%error, "broker event not applied");
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => bail!("broker event stream closed"),
            }

            if let Err(error) = self.poll(Instant::now()).await {
                warn!(%error, "device poll failed; retrying next iteration");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
