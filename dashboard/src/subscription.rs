//! Farm subscriptions: one sample store, one stream, one logical thread.
//!
//! A [`FarmSubscription`] owns the store of a farm together with the stream
//! connection feeding it. Its owner drives it by awaiting
//! [`FarmSubscription::next_event`], which is the only place the store is
//! mutated: stream events and finished history fetches are applied one at a
//! time, in the order they are observed.
//!
//! # Seeding while live
//!
//! History is fetched concurrently with the live stream, so a push can be
//! applied before the fetch that was started earlier completes. Pushes are
//! always applied at once so views stay live; in addition every push for a
//! device covered by an outstanding seed is recorded. When the seed lands,
//! the window is replaced by the fetched samples and the recorded pushes are
//! appended again in arrival order. The outcome depends only on the order of
//! requests and pushes, not on when the response arrives. A failed fetch
//! discards its record and leaves the live window untouched.
//!
//! Only the first farm snapshot replaces windows. Later snapshots, such as
//! the one fetched after a reconnect, are merged: a device's snapshot sample
//! is appended only when it is newer than the tail of its window.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use reqwest::Client;
use tokio::task::{self, AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::command::CommandDispatcher;
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState};
use crate::error::{FetchError, TransportError};
use crate::history::HistoryLoader;
use crate::message::PushMessage;
use crate::session::{Session, User};
use crate::store::{DuplicatePolicy, SampleStore};
use crate::types::Sample;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SeedTarget {
    /// Latest sample of every device in the farm.
    Farm,
    /// Recent history of one device.
    Device(String),
}

impl SeedTarget {
    fn covers(&self, device_id: &str) -> bool {
        match self {
            SeedTarget::Farm => true,
            SeedTarget::Device(id) => id == device_id,
        }
    }
}

#[derive(Debug)]
pub enum SubscriptionEvent {
    Connected,
    Disconnected {
        error: TransportError,
        retry_in: Option<Duration>,
    },
    Reconnecting {
        attempt: u32,
    },
    Telemetry {
        device_id: String,
        appended: bool,
    },
    Ignored {
        kind: String,
    },
    Seeded {
        target: SeedTarget,
        devices: usize,
    },
    SeedFailed {
        target: SeedTarget,
        error: FetchError,
    },
}

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub window_capacity: usize,
    pub duplicate_policy: DuplicatePolicy,
    pub history_limit: usize,
    pub reconnect: ReconnectPolicy,
}

impl From<&Config> for SubscriptionOptions {
    fn from(config: &Config) -> Self {
        SubscriptionOptions {
            window_capacity: config.window_capacity,
            duplicate_policy: config.duplicate_policy(),
            history_limit: config.history_limit,
            reconnect: config.reconnect,
        }
    }
}

/// Store plus the replay records of outstanding seeds. No I/O.
#[derive(Debug)]
pub struct SyncState {
    store: SampleStore,
    replay: HashMap<SeedTarget, Vec<(String, Sample)>>,
    history_seeded: HashSet<String>,
    farm_seeded: bool,
}

impl SyncState {
    pub fn new(store: SampleStore) -> Self {
        SyncState {
            store,
            replay: HashMap::new(),
            history_seeded: HashSet::new(),
            farm_seeded: false,
        }
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SampleStore {
        &mut self.store
    }

    /// Start recording pushes for `target`. A repeated request restarts the
    /// record.
    pub fn begin_seed(&mut self, target: SeedTarget) {
        self.replay.insert(target, Vec::new());
    }

    pub fn abandon_seed(&mut self, target: &SeedTarget) {
        self.replay.remove(target);
    }

    pub fn is_seeding(&self, target: &SeedTarget) -> bool {
        self.replay.contains_key(target)
    }

    pub fn apply_push(&mut self, device_id: &str, sample: Sample) -> bool {
        for (target, record) in self.replay.iter_mut() {
            if target.covers(device_id) {
                record.push((device_id.to_string(), sample.clone()));
            }
        }
        self.store.append(device_id, sample)
    }

    pub fn remove_device(&mut self, device_id: &str) -> bool {
        self.history_seeded.remove(device_id);
        self.store.remove(device_id)
    }

    pub fn clear(&mut self) {
        self.history_seeded.clear();
        self.store.clear();
    }

    /// Replace a device's window with its fetched history, sorted oldest
    /// first, then replay the pushes recorded since the request.
    pub fn complete_device_seed(&mut self, device_id: &str, mut samples: Vec<Sample>) {
        samples.sort_by_key(|s| s.timestamp);
        let pushed = self
            .replay
            .remove(&SeedTarget::Device(device_id.to_string()))
            .unwrap_or_default();

        self.store.seed(device_id, samples);
        for (_, sample) in pushed {
            self.store.append(device_id, sample);
        }
        self.history_seeded.insert(device_id.to_string());
    }

    /// Apply a farm snapshot. Returns the number of windows it changed.
    ///
    /// The first snapshot seeds one single-sample window per device, except
    /// for devices whose full history was already applied. Every later
    /// snapshot is merged: a device's sample is appended only when it is
    /// newer than what the window currently ends with.
    pub fn complete_farm_seed(&mut self, latest: HashMap<String, Sample>) -> usize {
        let pushed = self.replay.remove(&SeedTarget::Farm).unwrap_or_default();

        let mut latest: Vec<(String, Sample)> = latest.into_iter().collect();
        latest.sort_by(|a, b| a.0.cmp(&b.0));

        if std::mem::replace(&mut self.farm_seeded, true) {
            return self.merge_snapshot(latest);
        }

        let mut seeded = 0;
        for (device_id, sample) in latest {
            if self.history_seeded.contains(&device_id) && self.store.window_len(&device_id) > 0 {
                debug!(device_id = %device_id, "Keeping history window over farm snapshot");
                continue;
            }
            self.store.seed(&device_id, vec![sample]);
            for (_, sample) in pushed.iter().filter(|(id, _)| *id == device_id) {
                self.store.append(&device_id, sample.clone());
            }
            seeded += 1;
        }
        seeded
    }

    fn merge_snapshot(&mut self, latest: Vec<(String, Sample)>) -> usize {
        let mut merged = 0;
        for (device_id, sample) in latest {
            let newer = self
                .store
                .current(&device_id)
                .map_or(true, |current| sample.timestamp > current.timestamp);
            // Through the push path so outstanding device seeds replay it.
            if newer && self.apply_push(&device_id, sample) {
                merged += 1;
            }
        }
        merged
    }
}

enum Seed {
    Farm(HashMap<String, Sample>),
    Device { device_id: String, samples: Vec<Sample> },
}

type SeedOutcome = (SeedTarget, Result<Seed, FetchError>);

pub struct FarmSubscription {
    farm_id: String,
    session: Session,
    connections: ConnectionManager,
    connection: Option<ConnectionHandle>,
    loader: HistoryLoader,
    options: SubscriptionOptions,
    sync: SyncState,
    fetches: JoinSet<SeedOutcome>,
    in_flight: HashMap<SeedTarget, AbortHandle>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
}

impl FarmSubscription {
    pub fn open(
        farm_id: &str,
        session: Session,
        connections: ConnectionManager,
        loader: HistoryLoader,
        options: SubscriptionOptions,
    ) -> Result<Self, TransportError> {
        let connection = connections.open(farm_id, session.token())?;
        let store = SampleStore::new(options.window_capacity).with_policy(options.duplicate_policy);
        info!(
            farm_id,
            capacity = store.capacity(),
            policy = ?store.policy(),
            "Farm subscription opened"
        );

        Ok(FarmSubscription {
            farm_id: farm_id.to_string(),
            session,
            connections,
            connection: Some(connection),
            loader,
            backoff: Backoff::new(options.reconnect),
            options,
            sync: SyncState::new(store),
            fetches: JoinSet::new(),
            in_flight: HashMap::new(),
            reconnect_at: None,
        })
    }

    pub fn farm_id(&self) -> &str {
        &self.farm_id
    }

    pub fn store(&self) -> &SampleStore {
        self.sync.store()
    }

    /// For registering observers; all other mutation goes through
    /// [`FarmSubscription::next_event`].
    pub fn store_mut(&mut self) -> &mut SampleStore {
        self.sync.store_mut()
    }

    /// Forget a device. Its next farm snapshot seeds it afresh.
    pub fn remove_device(&mut self, device_id: &str) -> bool {
        self.sync.remove_device(device_id)
    }

    pub fn clear(&mut self) {
        self.sync.clear();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, ConnectionHandle::state)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn is_seeding(&self, target: &SeedTarget) -> bool {
        self.in_flight.contains_key(target)
    }

    pub fn request_farm_latest(&mut self) {
        self.spawn_seed(SeedTarget::Farm);
    }

    pub fn request_device_history(&mut self, device_id: &str) {
        self.spawn_seed(SeedTarget::Device(device_id.to_string()));
    }

    /// Forward a raw JSON frame on the farm stream.
    pub fn send(&self, message: &serde_json::Value) -> bool {
        self.connection.as_ref().is_some_and(|c| c.send(message))
    }

    /// Swap in a fresh credential. The stream is torn down and recreated;
    /// retained windows are kept.
    pub fn reauthenticate(&mut self, session: Session) -> Result<(), TransportError> {
        self.loader = self.loader.with_session(session.clone());
        self.session = session;
        self.connection = Some(self.connections.open(&self.farm_id, self.session.token())?);
        self.backoff.reset();
        self.reconnect_at = None;
        info!(farm_id = %self.farm_id, "Farm subscription reauthenticated");
        Ok(())
    }

    /// Wait for the next change. Returns `None` once nothing can happen
    /// anymore: no stream, no outstanding fetch, no pending reconnect.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                event = next_connection_event(&mut self.connection), if self.connection.is_some() => {
                    match event {
                        Some(event) => return Some(self.on_connection_event(event)),
                        None => self.connection = None,
                    }
                }
                Some(joined) = self.fetches.join_next_with_id() => {
                    match joined {
                        Ok((id, (target, result))) => {
                            if let Some(event) = self.on_seed_result(id, target, result) {
                                return Some(event);
                            }
                        }
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => self.on_task_failed(e.id(), &e),
                    }
                }
                _ = sleep_until(reconnect_at), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    return Some(self.reconnect());
                }
                else => return None,
            }
        }
    }

    /// Abort outstanding fetches and close the stream.
    pub async fn close(mut self) {
        self.fetches.abort_all();
        self.in_flight.clear();
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        info!(farm_id = %self.farm_id, "Farm subscription closed");
    }

    fn spawn_seed(&mut self, target: SeedTarget) {
        if let Some(previous) = self.in_flight.remove(&target) {
            debug!(farm_id = %self.farm_id, target = ?target, "Superseding outstanding fetch");
            previous.abort();
        }
        self.sync.begin_seed(target.clone());

        let loader = self.loader.clone();
        let farm_id = self.farm_id.clone();
        let limit = self.options.history_limit;
        let task_target = target.clone();

        let handle = self.fetches.spawn(async move {
            let result = match &task_target {
                SeedTarget::Farm => loader.fetch_farm_latest(&farm_id).await.map(Seed::Farm),
                SeedTarget::Device(device_id) => loader
                    .fetch_device_history(device_id, limit)
                    .await
                    .map(|samples| Seed::Device {
                        device_id: device_id.clone(),
                        samples,
                    }),
            };
            (task_target, result)
        });
        self.in_flight.insert(target, handle);
    }

    fn on_seed_result(
        &mut self,
        id: task::Id,
        target: SeedTarget,
        result: Result<Seed, FetchError>,
    ) -> Option<SubscriptionEvent> {
        match self.in_flight.get(&target) {
            Some(current) if current.id() == id => {
                self.in_flight.remove(&target);
            }
            _ => {
                debug!(farm_id = %self.farm_id, target = ?target, "Discarding superseded fetch result");
                return None;
            }
        }

        let event = match result {
            Ok(Seed::Farm(latest)) => {
                let devices = self.sync.complete_farm_seed(latest);
                info!(farm_id = %self.farm_id, devices, "Applied farm snapshot");
                SubscriptionEvent::Seeded { target, devices }
            }
            Ok(Seed::Device { device_id, samples }) => {
                let fetched = samples.len();
                self.sync.complete_device_seed(&device_id, samples);
                info!(farm_id = %self.farm_id, device_id = %device_id, fetched, "Applied device history");
                SubscriptionEvent::Seeded { target, devices: 1 }
            }
            Err(error) => {
                self.sync.abandon_seed(&target);
                warn!(farm_id = %self.farm_id, target = ?target, error = %error, "History fetch failed");
                SubscriptionEvent::SeedFailed { target, error }
            }
        };
        Some(event)
    }

    /// A fetch task died without a result. Stop recording for its target.
    fn on_task_failed(&mut self, id: task::Id, error: &task::JoinError) {
        error!(farm_id = %self.farm_id, error = %error, "History fetch task failed");
        let target = self
            .in_flight
            .iter()
            .find(|(_, handle)| handle.id() == id)
            .map(|(target, _)| target.clone());
        if let Some(target) = target {
            self.in_flight.remove(&target);
            self.sync.abandon_seed(&target);
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) -> SubscriptionEvent {
        match event {
            ConnectionEvent::Connected => {
                if self.backoff.attempt() > 0 {
                    // Pushes were missed while away.
                    self.request_farm_latest();
                }
                self.backoff.reset();
                SubscriptionEvent::Connected
            }
            ConnectionEvent::Disconnected(error) => {
                let retry_in = if self.options.reconnect.enabled {
                    self.backoff.next_delay()
                } else {
                    None
                };
                match retry_in {
                    Some(delay) => self.reconnect_at = Some(Instant::now() + delay),
                    None if self.options.reconnect.enabled => {
                        warn!(farm_id = %self.farm_id, attempts = self.backoff.attempt(), "Giving up on telemetry stream")
                    }
                    None => {}
                }
                SubscriptionEvent::Disconnected { error, retry_in }
            }
            ConnectionEvent::Message(PushMessage::Telemetry { device_id, sample }) => {
                let appended = self.sync.apply_push(&device_id, sample);
                SubscriptionEvent::Telemetry { device_id, appended }
            }
            ConnectionEvent::Message(PushMessage::Other { kind }) => {
                debug!(farm_id = %self.farm_id, kind = %kind, "Ignoring stream message");
                SubscriptionEvent::Ignored { kind }
            }
        }
    }

    fn reconnect(&mut self) -> SubscriptionEvent {
        let attempt = self.backoff.attempt();
        info!(farm_id = %self.farm_id, attempt, "Reconnecting telemetry stream");
        match self.connections.open(&self.farm_id, self.session.token()) {
            Ok(connection) => {
                self.connection = Some(connection);
                SubscriptionEvent::Reconnecting { attempt }
            }
            Err(error) => SubscriptionEvent::Disconnected {
                error,
                retry_in: None,
            },
        }
    }
}

async fn next_connection_event(connection: &mut Option<ConnectionHandle>) -> Option<ConnectionEvent> {
    match connection {
        Some(connection) => connection.recv().await,
        None => None,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

struct HubEntry {
    subscription: FarmSubscription,
    views: usize,
}

/// Reference-counted farm subscriptions.
///
/// The first view attaching to a farm creates its subscription and starts
/// the farm snapshot fetch; the last one detaching closes it.
pub struct SubscriptionHub {
    client: Client,
    api_url: String,
    options: SubscriptionOptions,
    session: Session,
    connections: ConnectionManager,
    loader: HistoryLoader,
    farms: HashMap<String, HubEntry>,
}

impl SubscriptionHub {
    pub fn new(config: &Config, session: Session) -> Result<Self, TransportError> {
        let client = Client::new();
        Ok(SubscriptionHub {
            loader: HistoryLoader::new(client.clone(), &config.api_url, session.clone()),
            connections: ConnectionManager::new(&config.ws_url)?,
            client,
            api_url: config.api_url.clone(),
            options: SubscriptionOptions::from(config),
            session,
            farms: HashMap::new(),
        })
    }

    pub fn attach(&mut self, farm_id: &str) -> Result<&mut FarmSubscription, TransportError> {
        match self.farms.entry(farm_id.to_string()) {
            Entry::Occupied(entry) => {
                let entry = entry.into_mut();
                entry.views += 1;
                debug!(farm_id, views = entry.views, "View attached");
                Ok(&mut entry.subscription)
            }
            Entry::Vacant(slot) => {
                let mut subscription = FarmSubscription::open(
                    farm_id,
                    self.session.clone(),
                    self.connections.clone(),
                    self.loader.clone(),
                    self.options.clone(),
                )?;
                subscription.request_farm_latest();
                let entry = slot.insert(HubEntry {
                    subscription,
                    views: 1,
                });
                Ok(&mut entry.subscription)
            }
        }
    }

    /// Returns `true` when this was the last view and the farm was closed.
    pub async fn detach(&mut self, farm_id: &str) -> bool {
        let Some(entry) = self.farms.get_mut(farm_id) else {
            return false;
        };
        entry.views = entry.views.saturating_sub(1);
        if entry.views > 0 {
            debug!(farm_id, views = entry.views, "View detached");
            return false;
        }
        if let Some(entry) = self.farms.remove(farm_id) {
            entry.subscription.close().await;
        }
        true
    }

    pub fn subscription(&self, farm_id: &str) -> Option<&FarmSubscription> {
        self.farms.get(farm_id).map(|e| &e.subscription)
    }

    pub fn subscription_mut(&mut self, farm_id: &str) -> Option<&mut FarmSubscription> {
        self.farms.get_mut(farm_id).map(|e| &mut e.subscription)
    }

    pub fn views(&self, farm_id: &str) -> usize {
        self.farms.get(farm_id).map_or(0, |e| e.views)
    }

    pub fn loader(&self) -> &HistoryLoader {
        &self.loader
    }

    pub fn dispatcher(&self) -> CommandDispatcher {
        CommandDispatcher::new(self.client.clone(), &self.api_url, self.session.clone())
    }

    /// Reconnect every open farm with a rotated credential.
    pub fn reauthenticate(&mut self, session: Session) -> Result<(), TransportError> {
        self.loader = self.loader.with_session(session.clone());
        for entry in self.farms.values_mut() {
            entry.subscription.reauthenticate(session.clone())?;
        }
        self.session = session;
        Ok(())
    }

    /// Close every farm.
    pub async fn shutdown(mut self) {
        for (_, entry) in self.farms.drain() {
            entry.subscription.close().await;
        }
    }

    /// Close every farm and end the session, e.g. after the backend
    /// rejected the credential.
    pub async fn logout(self) -> Option<User> {
        let session = self.session.clone();
        self.shutdown().await;
        info!("Session ended");
        session.logout()
    }
}
