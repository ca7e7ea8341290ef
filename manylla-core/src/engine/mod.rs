//! Sync engine: owns device identity and drives push/pull against the relay.
//!
//! The engine is an explicit handle (cheap to clone) owned by the host's
//! composition root. Storage, transport and randomness are injected.
//!
//! State machine: `Disabled -> Enabling -> Enabled(Idle | Pulling | Pushing)
//! -> Disabled`. `enable` and `disable` bump an epoch counter; an in-flight
//! call that finishes under an older epoch has its result discarded and
//! returns [`ManyllaError::Cancelled`].
//!
//! Concurrency: at most one pull and one push run at a time, and merges
//! serialize their read-modify-write of the local profile.

mod debounce;
mod queue;


pub use queue::{OfflineQueue, QueueEntry, QueuedOperation};

use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::crypto::{self, derive_sync_keys_async, RecoveryPhrase, SyncKeys};
use crate::device::DeviceIdentity;
use crate::invite::{self, generate_invite_code, InviteStore};
use crate::models::{now_millis, Profile, SyncProfile, Timestamp};
use crate::photo::{photo_id, restore_after_sync, strip_for_sync, PhotoStore};
use crate::random::SecureRandom;
use crate::share::{self, ShareOptions, SharePayload};
use crate::storage::{
    Storage, KEY_LAST_PULL, KEY_PROFILE, KEY_RECOVERY_PHRASE, KEY_SYNC_ENABLED, KEY_SYNC_ID, SYNC_KEYS,
};
use crate::transport::{Endpoint, Transport, TransportError, TransportResponse};
use crate::{ManyllaError, Result};
use debounce::{Debouncer, Turn};
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Relay reply meaning "nothing stored for this sync id yet".
pub const NO_DATA_FOUND: &str = "No data found";

/// What the engine is doing while enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Pulling,
    Pushing,
}

/// Engine lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Disabled,
    Enabling,
    Enabled(Activity),
}

/// Notifications delivered to listeners.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Enabled { sync_id: String },
    Disabled,
    Pushed { timestamp: Timestamp },
    Pulled { profile: Profile },
    PushFailed { error: String, retryable: bool },
    PullFailed { error: String, retryable: bool },
    Online,
    Offline,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub sync_id: Option<String>,
    pub online: bool,
    pub polling: bool,
    pub last_pull: Option<Timestamp>,
    pub last_push: Option<Timestamp>,
    pub queued_operations: usize,
}

/// Listener registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct EngineState {
    enabling: bool,
    phrase: Option<RecoveryPhrase>,
    keys: Option<SyncKeys>,
    pulling: bool,
    pushing: bool,
    last_pull: Option<Timestamp>,
    last_push: Option<Timestamp>,
}

impl EngineState {
    fn disabled() -> Self {
        Self {
            enabling: false,
            phrase: None,
            keys: None,
            pulling: false,
            pushing: false,
            last_pull: None,
            last_push: None,
        }
    }

    fn phase(&self) -> SyncPhase {
        if self.keys.is_some() {
            if self.pushing {
                SyncPhase::Enabled(Activity::Pushing)
            } else if self.pulling {
                SyncPhase::Enabled(Activity::Pulling)
            } else {
                SyncPhase::Enabled(Activity::Idle)
            }
        } else if self.enabling {
            SyncPhase::Enabling
        } else {
            SyncPhase::Disabled
        }
    }
}

struct EngineInner {
    config: SyncConfig,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    random: Arc<dyn SecureRandom>,
    photos: PhotoStore,
    invites: InviteStore,
    device: OnceCell<DeviceIdentity>,

    state: RwLock<EngineState>,
    epoch: AtomicU64,
    online: AtomicBool,
    processing_offline_queue: AtomicBool,
    queue: Mutex<OfflineQueue>,

    push_gate: Mutex<()>,
    pull_gate: Mutex<()>,
    profile_gate: Mutex<()>,
    last_request: Mutex<Option<Instant>>,
    debouncer: Debouncer<Profile, Result<Timestamp>>,

    listeners: std::sync::Mutex<Vec<(ListenerId, Listener)>>,
    next_listener_id: AtomicU64,
    poll_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    monitor_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for slot in [&self.poll_task, &self.monitor_task] {
            if let Some(handle) = lock_std(slot).take() {
                handle.abort();
            }
        }
    }
}

fn lock_std<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the offline-queue flag when a drain ends, including on panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Zero-knowledge profile sync engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine in the `Disabled` phase.
    pub fn new(
        config: SyncConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        random: Arc<dyn SecureRandom>,
    ) -> Result<Self> {
        config.validate()?;

        let inner = EngineInner {
            photos: PhotoStore::new(storage.clone()),
            invites: InviteStore::with_ttl(storage.clone(), config.invite_ttl_ms()),
            device: OnceCell::new(),
            state: RwLock::new(EngineState::disabled()),
            epoch: AtomicU64::new(0),
            online: AtomicBool::new(true),
            processing_offline_queue: AtomicBool::new(false),
            queue: Mutex::new(OfflineQueue::new(config.offline_queue_capacity)),
            push_gate: Mutex::new(()),
            pull_gate: Mutex::new(()),
            profile_gate: Mutex::new(()),
            last_request: Mutex::new(None),
            debouncer: Debouncer::new(config.push_debounce()),
            listeners: std::sync::Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            poll_task: std::sync::Mutex::new(None),
            monitor_task: std::sync::Mutex::new(None),
            config,
            storage,
            transport,
            random,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // --- Lifecycle ---

    /// Enable sync with `phrase`.
    ///
    /// `is_new` marks a freshly created sync group: an existing local profile
    /// is pushed right away, and a push failure is reported through
    /// [`SyncEvent::PushFailed`] without failing the call. When joining
    /// (`is_new == false`) one pull runs and its error is returned; sync
    /// stays enabled either way.
    ///
    /// Switching to a different group discards the previous group's pull
    /// cursor, offline queue and pending debounced push.
    pub async fn enable(&self, phrase: &str, is_new: bool) -> Result<()> {
        let phrase = RecoveryPhrase::parse(phrase)?;

        self.stop_polling();
        let epoch = self.bump_epoch();
        {
            let mut state = self.inner.state.write().await;
            *state = EngineState::disabled();
            state.enabling = true;
        }

        let keys = match derive_sync_keys_async(phrase.clone()).await {
            Ok(keys) => keys,
            Err(e) => {
                self.abort_enable(epoch).await;
                return Err(e.into());
            }
        };
        if !self.is_current(epoch) {
            return Err(ManyllaError::Cancelled);
        }

        let previous_group = self.read_key(KEY_SYNC_ID).await;
        if previous_group.as_deref() != Some(keys.sync_id.as_str()) {
            self.forget_group_state().await;
        }

        if let Err(e) = self.persist_enabled(&phrase, &keys).await {
            self.abort_enable(epoch).await;
            return Err(e);
        }

        let last_pull = self
            .read_key(KEY_LAST_PULL)
            .await
            .and_then(|v| v.parse::<Timestamp>().ok());
        let sync_id = keys.sync_id.to_string();
        {
            let mut state = self.inner.state.write().await;
            if !self.is_current(epoch) {
                return Err(ManyllaError::Cancelled);
            }
            state.enabling = false;
            state.phrase = Some(phrase);
            state.keys = Some(keys);
            state.last_pull = last_pull;
        }

        info!("Sync enabled for {}", short_id(&sync_id));
        self.start_polling();
        self.notify(SyncEvent::Enabled { sync_id });

        if is_new {
            if let Some(profile) = self.local_profile().await {
                if let Err(e) = self.push_now(profile).await {
                    warn!("Initial push failed: {}", e);
                }
            }
            Ok(())
        } else {
            self.pull().await.map(|_| ())
        }
    }

    /// Disable sync: stop timers, forget keys and remove sync storage.
    ///
    /// The local profile, device identity and photos are kept.
    pub async fn disable(&self) -> Result<()> {
        self.bump_epoch();
        self.stop_polling();
        self.stop_connectivity_monitor();
        self.inner.debouncer.cancel();

        *self.inner.state.write().await = EngineState::disabled();
        self.inner.queue.lock().await.clear();

        let mut first_error = None;
        for key in SYNC_KEYS {
            if let Err(e) = self.inner.storage.remove(key).await {
                warn!("Failed to remove {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }

        info!("Sync disabled");
        self.notify(SyncEvent::Disabled);

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Re-enable from persisted state after a restart.
    ///
    /// Returns `false` when sync was never enabled. Transient pull failures
    /// during the catch-up pull are logged and queued, not returned.
    pub async fn resume(&self) -> Result<bool> {
        let enabled = self.read_key(KEY_SYNC_ENABLED).await.as_deref() == Some("true");
        let phrase = match (enabled, self.read_key(KEY_RECOVERY_PHRASE).await) {
            (true, Some(phrase)) => phrase,
            _ => return Ok(false),
        };

        match self.enable(&phrase, false).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_retryable() => {
                warn!("Catch-up pull deferred: {}", e);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.state.read().await.keys.is_some()
    }

    pub async fn phase(&self) -> SyncPhase {
        self.inner.state.read().await.phase()
    }

    pub async fn sync_id(&self) -> Option<String> {
        self.inner
            .state
            .read()
            .await
            .keys
            .as_ref()
            .map(|k| k.sync_id.to_string())
    }

    /// Recovery phrase currently in use, for display in the pairing screen.
    pub async fn recovery_phrase(&self) -> Option<RecoveryPhrase> {
        self.inner.state.read().await.phrase.clone()
    }

    pub async fn status(&self) -> SyncStatus {
        let queued_operations = self.inner.queue.lock().await.len();
        let state = self.inner.state.read().await;
        SyncStatus {
            phase: state.phase(),
            sync_id: state.keys.as_ref().map(|k| k.sync_id.to_string()),
            online: self.is_online(),
            polling: self.is_polling(),
            last_pull: state.last_pull,
            last_push: state.last_push,
            queued_operations,
        }
    }

    /// This install's device identity, created on first use.
    pub async fn device(&self) -> &DeviceIdentity {
        self.inner
            .device
            .get_or_init(|| DeviceIdentity::load_or_create(&*self.inner.storage, &*self.inner.random))
            .await
    }

    // --- Push ---

    /// Save `profile` locally and push it after the debounce window.
    ///
    /// Pushes submitted within one window collapse into a single relay call
    /// carrying the latest profile; every caller receives that call's result.
    pub async fn push(&self, profile: Profile) -> Result<Timestamp> {
        self.require_enabled().await?;
        self.save_local_profile(&profile).await?;

        match self.inner.debouncer.submit(profile).await {
            Turn::Leader(batch) => {
                if batch.size() > 1 {
                    debug!("Collapsed {} pushes into one", batch.size());
                }
                let outcome = self.push_now(batch.value.clone()).await;
                batch.finish(outcome)
            }
            Turn::Follower(rx) => rx.await.unwrap_or(Err(ManyllaError::Cancelled)),
        }
    }

    /// Push immediately, bypassing the debounce window.
    pub async fn push_now(&self, profile: Profile) -> Result<Timestamp> {
        self.require_enabled().await?;
        self.inner.photos.store_from(&profile).await?;
        self.send_push(strip_for_sync(&profile), true).await
    }

    /// Encrypt and upload `payload`. With `defer` set, an offline failure
    /// queues the payload for replay.
    async fn send_push(&self, payload: SyncProfile, defer: bool) -> Result<Timestamp> {
        let epoch = self.epoch();
        let keys = self.keys().await?;

        if !self.is_online() {
            if defer {
                self.enqueue(QueuedOperation::Push, Some(payload)).await;
            }
            let err = ManyllaError::Offline("device is offline; push queued".to_string());
            self.notify_failure(true, &err);
            return Err(err);
        }

        let _gate = self.inner.push_gate.lock().await;
        if !self.is_current(epoch) {
            return Err(ManyllaError::Cancelled);
        }

        self.set_activity(epoch, |s| s.pushing = true).await;
        let result = self.merge_and_upload(epoch, &keys, &payload).await;
        self.set_activity(epoch, |s| s.pushing = false).await;

        if !self.is_current(epoch) {
            debug!("Discarding push result from a previous session");
            return Err(ManyllaError::Cancelled);
        }

        match result {
            Ok(resp) => {
                let timestamp = resp
                    .json
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .unwrap_or_else(now_millis);
                self.inner.state.write().await.last_push = Some(timestamp);
                debug!("Pushed profile for {}", keys.sync_id.short());
                self.notify(SyncEvent::Pushed { timestamp });
                Ok(timestamp)
            }
            Err(ManyllaError::Offline(msg)) => {
                self.mark_offline();
                if defer {
                    self.enqueue(QueuedOperation::Push, Some(payload)).await;
                }
                let err = ManyllaError::Offline(msg);
                self.notify_failure(true, &err);
                Err(err)
            }
            Err(e) => {
                self.notify_failure(true, &e);
                Err(e)
            }
        }
    }

    /// Fold the relay copy into `payload`, then upload the merged snapshot.
    ///
    /// The relay keeps a single blob per group: the uploaded snapshot always
    /// contains what the relay held before. The merged result is written back
    /// to the local profile as well.
    async fn merge_and_upload(&self, epoch: u64, keys: &SyncKeys, payload: &SyncProfile) -> Result<TransportResponse> {
        let current = Endpoint::Pull {
            sync_id: keys.sync_id.to_string(),
            since: None,
        };
        let resp = self.send_with_retry(current, None).await?;

        let merged = match remote_blob(&resp).map(|blob| crypto::decrypt::<SyncProfile>(blob, &keys.master_key)) {
            Some(Ok(remote)) => {
                let merged = ConflictResolver::merge(payload, &remote);
                let _profile = self.inner.profile_gate.lock().await;
                let local = self.local_profile().await;
                let updated = self.merge_with_local(local.as_ref(), &merged).await;
                if !self.is_current(epoch) {
                    return Err(ManyllaError::Cancelled);
                }
                self.write_profile(&updated).await?;
                merged
            }
            Some(Err(e)) => {
                warn!("Relay copy for {} is unreadable and will be replaced: {}", keys.sync_id.short(), e);
                payload.clone()
            }
            None => payload.clone(),
        };

        if !self.is_current(epoch) {
            return Err(ManyllaError::Cancelled);
        }
        let encrypted_blob = crypto::encrypt(&merged, &keys.master_key, &*self.inner.random)?;
        let device_id = self.device().await.device_id.clone();
        let body = json!({
            "sync_id": keys.sync_id.as_str(),
            "device_id": device_id,
            "encrypted_blob": encrypted_blob,
        });
        self.send_with_retry(Endpoint::Push, Some(body)).await
    }

    // --- Pull ---

    /// Fetch, decrypt and merge the relay copy into the local profile.
    ///
    /// Returns `Ok(None)` when the relay holds nothing yet; local storage is
    /// not touched in that case.
    pub async fn pull(&self) -> Result<Option<Profile>> {
        self.fetch_and_merge(true).await
    }

    async fn fetch_and_merge(&self, defer: bool) -> Result<Option<Profile>> {
        let epoch = self.epoch();
        let keys = self.keys().await?;

        if !self.is_online() {
            if defer {
                self.enqueue(QueuedOperation::Pull, None).await;
            }
            let err = ManyllaError::Offline("device is offline; pull queued".to_string());
            self.notify_failure(false, &err);
            return Err(err);
        }

        let _gate = self.inner.pull_gate.lock().await;
        if !self.is_current(epoch) {
            return Err(ManyllaError::Cancelled);
        }

        let since = self.inner.state.read().await.last_pull;
        let endpoint = Endpoint::Pull {
            sync_id: keys.sync_id.to_string(),
            since,
        };

        self.set_activity(epoch, |s| s.pulling = true).await;
        let result = self.send_with_retry(endpoint, None).await;
        self.set_activity(epoch, |s| s.pulling = false).await;

        if !self.is_current(epoch) {
            debug!("Discarding pull result from a previous session");
            return Err(ManyllaError::Cancelled);
        }

        let resp = match result {
            Ok(resp) => resp,
            Err(ManyllaError::Offline(msg)) => {
                self.mark_offline();
                if defer {
                    self.enqueue(QueuedOperation::Pull, None).await;
                }
                let err = ManyllaError::Offline(msg);
                self.notify_failure(false, &err);
                return Err(err);
            }
            Err(e) => {
                self.notify_failure(false, &e);
                return Err(e);
            }
        };

        let blob = match remote_blob(&resp) {
            Some(blob) => blob,
            None => {
                debug!("Relay holds no data for {}", keys.sync_id.short());
                return Ok(None);
            }
        };

        let remote: SyncProfile = match crypto::decrypt(blob, &keys.master_key) {
            Ok(remote) => remote,
            Err(e) => {
                let err = ManyllaError::from(e);
                warn!("Pulled data could not be decrypted");
                self.notify_failure(false, &err);
                return Err(err);
            }
        };

        let merged = {
            let _profile = self.inner.profile_gate.lock().await;
            let local = self.local_profile().await;
            let merged = self.merge_with_local(local.as_ref(), &remote).await;

            if !self.is_current(epoch) {
                return Err(ManyllaError::Cancelled);
            }
            self.write_profile(&merged).await?;
            merged
        };

        let pulled_at = resp
            .json
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(now_millis);
        self.inner.state.write().await.last_pull = Some(pulled_at);
        if let Err(e) = self
            .inner
            .storage
            .set(KEY_LAST_PULL, &pulled_at.to_string())
            .await
        {
            warn!("Failed to persist last pull time: {}", e);
        }

        debug!("Merged remote profile for {}", keys.sync_id.short());
        self.notify(SyncEvent::Pulled {
            profile: merged.clone(),
        });
        Ok(Some(merged))
    }

    async fn merge_with_local(&self, local: Option<&Profile>, remote: &SyncProfile) -> Profile {
        let merged = match local {
            Some(local) => ConflictResolver::merge(&strip_for_sync(local), remote),
            None => remote.clone(),
        };

        let mut photos = self.inner.photos.source_for(&merged).await;
        if let Some(local) = local {
            if let Some(photo) = &local.photo {
                photos
                    .entry(photo_id(&local.content.id))
                    .or_insert_with(|| photo.0.clone());
            }
        }
        restore_after_sync(merged, &photos)
    }

    // --- Polling ---

    /// Start the fixed-interval pull timer. Calling it twice is a no-op.
    pub fn start_polling(&self) {
        let mut slot = lock_std(&self.inner.poll_task);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.poll_interval();
        *slot = Some(tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await; // Skip first tick

            loop {
                timer.tick().await;
                match upgrade(&weak) {
                    Some(engine) => engine.poll_once().await,
                    None => break,
                }
            }
        }));
        debug!("Polling started ({:?})", period);
    }

    /// Stop the pull timer. Safe to call from any state.
    pub fn stop_polling(&self) {
        if let Some(handle) = lock_std(&self.inner.poll_task).take() {
            handle.abort();
            debug!("Polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        lock_std(&self.inner.poll_task)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    async fn poll_once(&self) {
        if !self.is_enabled().await {
            return;
        }
        if !self.is_online() {
            // Offline: probe instead of pulling, and drain once reachable
            if self.check_health().await {
                self.set_online(true).await;
            }
            return;
        }
        if let Err(e) = self.pull().await {
            warn!("Scheduled pull failed: {}", e);
        }
    }

    // --- Connectivity ---

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Record a connectivity change.
    ///
    /// Going online fires [`SyncEvent::Online`] and replays the offline
    /// queue. Repeating the current state does nothing.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }

        if online {
            info!("Connectivity restored");
            self.notify(SyncEvent::Online);
            if let Err(e) = self.drain_offline_queue().await {
                warn!("Offline queue replay stopped: {}", e);
            }
        } else {
            info!("Connectivity lost");
            self.notify(SyncEvent::Offline);
        }
    }

    fn mark_offline(&self) {
        if self.inner.online.swap(false, Ordering::SeqCst) {
            info!("Relay unreachable, switching to offline mode");
            self.notify(SyncEvent::Offline);
        }
    }

    /// `true` only when the relay answers `{status: "healthy"}`.
    pub async fn check_health(&self) -> bool {
        self.throttle().await;
        match self
            .inner
            .transport
            .request(Endpoint::Health, Endpoint::Health.method(), None)
            .await
        {
            Ok(resp) => resp.ok && resp.json.get("status").and_then(Value::as_str) == Some("healthy"),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Probe the relay periodically and track connectivity. Idempotent.
    pub fn start_connectivity_monitor(&self) {
        let mut slot = lock_std(&self.inner.monitor_task);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval();
        *slot = Some(tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                let Some(engine) = upgrade(&weak) else { break };
                let healthy = engine.check_health().await;
                engine.set_online(healthy).await;
            }
        }));
    }

    pub fn stop_connectivity_monitor(&self) {
        if let Some(handle) = lock_std(&self.inner.monitor_task).take() {
            handle.abort();
        }
    }

    // --- Offline queue ---

    /// Snapshot of deferred operations, oldest first.
    pub async fn offline_queue(&self) -> Vec<QueueEntry> {
        self.inner.queue.lock().await.snapshot()
    }

    async fn enqueue(&self, operation: QueuedOperation, payload: Option<SyncProfile>) {
        let entry = QueueEntry {
            operation,
            payload,
            timestamp: now_millis(),
        };
        let mut queue = self.inner.queue.lock().await;
        if let Some(dropped) = queue.push(entry) {
            warn!("Offline queue full, dropped {:?} from {}", dropped.operation, dropped.timestamp);
        }
        debug!("Queued {:?}, {} pending", operation, queue.len());
    }

    /// Replay queued operations in FIFO order.
    ///
    /// Only one drain runs at a time; a concurrent call returns `Ok(0)`.
    /// Entries that fail because the device went offline again stay queued.
    pub async fn drain_offline_queue(&self) -> Result<usize> {
        if self
            .inner
            .processing_offline_queue
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let _guard = DrainGuard(&self.inner.processing_offline_queue);

        let mut pending = std::collections::VecDeque::from(self.inner.queue.lock().await.drain());
        if pending.is_empty() {
            return Ok(0);
        }
        info!("Replaying {} queued operations", pending.len());

        let mut replayed = 0;
        let mut pulled = false;
        while let Some(entry) = pending.pop_front() {
            if !self.is_online() {
                pending.push_front(entry);
                break;
            }

            let result = match (entry.operation, entry.payload.clone()) {
                (QueuedOperation::Push, Some(payload)) => self.send_push(payload, false).await.map(|_| ()),
                (QueuedOperation::Push, None) => Ok(()),
                (QueuedOperation::Pull, _) if pulled => Ok(()),
                (QueuedOperation::Pull, _) => {
                    pulled = true;
                    self.fetch_and_merge(false).await.map(|_| ())
                }
            };

            match result {
                Ok(()) => replayed += 1,
                Err(ManyllaError::Offline(_)) => {
                    pending.push_front(entry);
                    break;
                }
                Err(ManyllaError::Cancelled) | Err(ManyllaError::NotInitialized) => {
                    pending.clear();
                    break;
                }
                Err(e) => warn!("Dropping queued {:?}: {}", entry.operation, e),
            }
        }

        if !pending.is_empty() {
            debug!("{} queued operations still pending", pending.len());
            self.inner.queue.lock().await.requeue_front(pending.into());
        }
        Ok(replayed)
    }

    // --- Invites ---

    /// Create an invite code for this sync group and return the pairing URL.
    ///
    /// The invite is stored locally and registered with the relay. Relay
    /// registration is best-effort since the URL carries everything a second
    /// device needs.
    pub async fn create_invite(&self, base_url: &str) -> Result<String> {
        let (phrase, sync_id) = {
            let state = self.inner.state.read().await;
            match (&state.phrase, &state.keys) {
                (Some(phrase), Some(keys)) => (phrase.clone(), keys.sync_id.to_string()),
                _ => return Err(ManyllaError::NotInitialized),
            }
        };

        let code = generate_invite_code(&*self.inner.random);
        self.inner.invites.store(&code, &sync_id, &phrase).await?;

        let device_id = self.device().await.device_id.clone();
        let body = json!({
            "invite_code": code,
            "sync_id": sync_id,
            "device_id": device_id,
        });
        if let Err(e) = self.send_with_retry(Endpoint::CreateInvite, Some(body)).await {
            warn!("Invite not registered with relay: {}", e);
        }

        invite::pack_invite_url(&code, &phrase, base_url)
    }

    /// Look up an invite created on this device.
    pub async fn local_invite(&self, code: &str) -> Result<Option<invite::InviteRecord>> {
        self.inner.invites.get(code).await
    }

    /// Join a sync group from a pairing URL's path and fragment.
    ///
    /// The relay is asked whether the code is still valid; an explicit
    /// "invalid" answer fails with [`ManyllaError::Expired`], an unreachable
    /// relay does not block joining.
    pub async fn join_from_invite(&self, path: &str, fragment: &str) -> Result<()> {
        let (code, phrase) = invite::unpack_invite_url(path, fragment)?;

        self.throttle().await;
        let endpoint = Endpoint::ValidateInvite { code };
        match self.inner.transport.request(endpoint.clone(), endpoint.method(), None).await {
            Ok(resp) if resp.json.get("valid").and_then(Value::as_bool) == Some(false) => {
                return Err(ManyllaError::Expired);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not validate invite with relay: {}", e),
        }

        self.enable(phrase.as_str(), false).await
    }

    // --- Sharing ---

    /// Upload a temporary share and return its link.
    pub async fn create_share(&self, profile: &Profile, options: &ShareOptions, origin: &str) -> Result<String> {
        let prepared = share::prepare_share(profile, options, &*self.inner.random)?;
        let body = json!({
            "access_code": prepared.access_code,
            "encrypted_data": prepared.encrypted_data,
            "recipient_type": prepared.recipient_type,
            "expiry_hours": prepared.expiry_hours,
        });
        self.send_with_retry(Endpoint::ShareCreate, Some(body)).await?;
        Ok(prepared.url(origin))
    }

    /// Fetch and decrypt a share from its link's path and fragment.
    pub async fn open_share(&self, path: &str, fragment: &str) -> Result<SharePayload> {
        let (code, key) = share::parse_share_url(path, fragment)?;
        let resp = self
            .send_with_retry(Endpoint::ShareAccess { code }, None)
            .await?;
        let encrypted = resp
            .json
            .get("encrypted_data")
            .and_then(Value::as_str)
            .ok_or_else(|| ManyllaError::Serialization("share response has no data".to_string()))?;
        share::open_share(encrypted, &key)
    }

    // --- Listeners ---

    /// Register a listener. Panics inside a listener are caught and logged.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst));
        lock_std(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock_std(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn notify(&self, event: SyncEvent) {
        let listeners: Vec<Listener> = lock_std(&self.inner.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("Sync listener panicked while handling {}", event_name(&event));
            }
        }
    }

    fn notify_failure(&self, push: bool, error: &ManyllaError) {
        let error_text = error.to_string();
        let retryable = error.is_retryable();
        self.notify(if push {
            SyncEvent::PushFailed {
                error: error_text,
                retryable,
            }
        } else {
            SyncEvent::PullFailed {
                error: error_text,
                retryable,
            }
        });
    }

    // --- Local profile ---

    /// The locally persisted profile, if any.
    pub async fn local_profile(&self) -> Option<Profile> {
        let json = self.read_key(KEY_PROFILE).await?;
        match serde_json::from_str(&json) {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Ignoring unreadable local profile: {}", e);
                None
            }
        }
    }

    /// Persist the full profile locally without pushing it.
    pub async fn save_local_profile(&self, profile: &Profile) -> Result<()> {
        let _profile = self.inner.profile_gate.lock().await;
        self.write_profile(profile).await
    }

    async fn write_profile(&self, profile: &Profile) -> Result<()> {
        let json = serde_json::to_string(profile)?;
        self.inner.storage.set(KEY_PROFILE, &json).await?;
        Ok(())
    }

    // --- Internals ---

    fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) -> u64 {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    async fn require_enabled(&self) -> Result<()> {
        self.keys().await.map(|_| ())
    }

    async fn keys(&self) -> Result<SyncKeys> {
        self.inner
            .state
            .read()
            .await
            .keys
            .clone()
            .ok_or(ManyllaError::NotInitialized)
    }

    async fn set_activity(&self, epoch: u64, update: impl FnOnce(&mut EngineState)) {
        let mut state = self.inner.state.write().await;
        if self.is_current(epoch) && state.keys.is_some() {
            update(&mut *state);
        }
    }

    async fn abort_enable(&self, epoch: u64) {
        if self.is_current(epoch) {
            *self.inner.state.write().await = EngineState::disabled();
        }
    }

    /// Drop state tied to the previous sync group: the incremental pull
    /// cursor, queued payloads and any debounced push.
    async fn forget_group_state(&self) {
        self.inner.debouncer.cancel();
        self.inner.queue.lock().await.clear();
        if let Err(e) = self.inner.storage.remove(KEY_LAST_PULL).await {
            warn!("Failed to reset last pull time: {}", e);
        }
    }

    async fn persist_enabled(&self, phrase: &RecoveryPhrase, keys: &SyncKeys) -> Result<()> {
        let storage = &self.inner.storage;
        let result = async {
            storage.set(KEY_RECOVERY_PHRASE, phrase.as_str()).await?;
            storage.set(KEY_SYNC_ID, keys.sync_id.as_str()).await?;
            storage.set(KEY_SYNC_ENABLED, "true").await
        }
        .await;

        if let Err(e) = result {
            // Leave storage as it was before enable()
            for key in [KEY_SYNC_ENABLED, KEY_RECOVERY_PHRASE, KEY_SYNC_ID] {
                let _ = storage.remove(key).await;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Storage read where failure counts as absent.
    async fn read_key(&self, key: &str) -> Option<String> {
        match self.inner.storage.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                None
            }
        }
    }

    /// Keep relay calls at least `min_request_interval` apart.
    async fn throttle(&self) {
        let min_interval = self.inner.config.min_request_interval();
        let mut last = self.inner.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Call the relay, retrying transient failures up to `max_retries` times.
    ///
    /// Connectivity failures are returned at once as `Offline` so the caller
    /// can queue the operation.
    async fn send_with_retry(&self, endpoint: Endpoint, body: Option<Value>) -> Result<TransportResponse> {
        let max_attempts = self.inner.config.max_retries;
        let mut last_error = ManyllaError::Network("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            self.throttle().await;
            let outcome = self
                .inner
                .transport
                .request(endpoint.clone(), endpoint.method(), body.clone())
                .await;

            last_error = match outcome {
                Ok(resp) if is_final(&resp) => return Ok(resp),
                Ok(resp) => ManyllaError::Network(
                    resp.error()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("relay rejected {}", endpoint.name())),
                ),
                Err(TransportError::Offline(msg)) => return Err(ManyllaError::Offline(msg)),
                Err(TransportError::Failed(msg)) => ManyllaError::Network(msg),
            };

            if attempt < max_attempts {
                debug!(
                    "{} attempt {}/{} failed: {}",
                    endpoint.name(),
                    attempt,
                    max_attempts,
                    last_error
                );
                tokio::time::sleep(self.inner.config.retry_delay()).await;
            }
        }

        warn!("{} failed after {} attempts: {}", endpoint.name(), max_attempts, last_error);
        Err(last_error)
    }
}

fn upgrade(weak: &Weak<EngineInner>) -> Option<SyncEngine> {
    weak.upgrade().map(|inner| SyncEngine { inner })
}

/// A response that needs no retry: success, or the relay's "no data" reply.
fn is_final(resp: &TransportResponse) -> bool {
    (resp.ok && resp.success()) || resp.error() == Some(NO_DATA_FOUND)
}

/// Encrypted blob of a pull response, `None` for "nothing stored".
fn remote_blob(resp: &TransportResponse) -> Option<&str> {
    if resp.error() == Some(NO_DATA_FOUND) {
        return None;
    }
    resp.json
        .get("encrypted_blob")
        .or_else(|| resp.json.get("data"))
        .and_then(Value::as_str)
        .filter(|blob| !blob.is_empty())
}

fn short_id(sync_id: &str) -> &str {
    sync_id.get(..8).unwrap_or(sync_id)
}

fn event_name(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::Enabled { .. } => "enabled",
        SyncEvent::Disabled => "disabled",
        SyncEvent::Pushed { .. } => "pushed",
        SyncEvent::Pulled { .. } => "pulled",
        SyncEvent::PushFailed { .. } => "push_failed",
        SyncEvent::PullFailed { .. } => "pull_failed",
        SyncEvent::Online => "online",
        SyncEvent::Offline => "offline",
    }
}
