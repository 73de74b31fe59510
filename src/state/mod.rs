pub mod active_rooms;
pub mod clock;
pub mod hub;
pub mod room;
pub mod rounds;
pub mod session;

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::{
    config::AppConfig,
    dao::{kv_store::KvStore, room_store::RoomStore},
    error::ServiceError,
};

use self::{active_rooms::ActiveRoomRegistry, clock::ServerClock, hub::RoomHub, rounds::RoundScheduler};

pub type SharedState = Arc<AppState>;

/// Central application state: the store handle and the process-local coordination structures.
pub struct AppState {
    store: RwLock<Option<RoomStore>>,
    degraded: watch::Sender<bool>,
    config: AppConfig,
    hub: RoomHub,
    active_rooms: ActiveRoomRegistry,
    rounds: RoundScheduler,
    clock: ServerClock,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            store: RwLock::new(None),
            degraded: degraded_tx,
            config,
            hub: RoomHub::new(),
            active_rooms: ActiveRoomRegistry::new(),
            rounds: RoundScheduler::new(),
            clock: ServerClock::new(),
        })
    }

    /// Build a state with `kv` already installed.
    pub async fn with_store(config: AppConfig, kv: Arc<dyn KvStore>) -> SharedState {
        let state = Self::new(config);
        state.install_store(kv).await;
        state
    }

    /// Obtain a handle to the current room store, if one is installed.
    pub async fn store(&self) -> Option<RoomStore> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// Room store or [`ServiceError::Degraded`] when storage is down.
    pub async fn require_store(&self) -> Result<RoomStore, ServiceError> {
        if self.is_degraded() {
            return Err(ServiceError::Degraded);
        }
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a storage backend and leave degraded mode.
    pub async fn install_store(&self, kv: Arc<dyn KvStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(RoomStore::new(kv, self.config.store_limits()));
        }
        self.set_degraded(false);
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn set_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Connections and per-room broadcast groups.
    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    pub fn active_rooms(&self) -> &ActiveRoomRegistry {
        &self.active_rooms
    }

    /// Round lifecycles and their timer tasks.
    pub fn rounds(&self) -> &RoundScheduler {
        &self.rounds
    }

    /// Current server time in milliseconds since the Unix epoch.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}
