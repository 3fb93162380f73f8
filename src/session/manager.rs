//! Session lifecycle and the operations offered to presentation code.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, error, info, warn};
use matrix_sdk::ruma::{DeviceId, EventId, MxcUri, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::json;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::Config,
    crypto::{
        DeviceKey, DeviceTrust, EncryptionCoordinator, SecurityWarning,
        coordinator::RoomEncryptionContext,
    },
    error::EngineError,
    matrix::{
        Homeserver, HomeserverClient, MatrixClient, RequestError,
        events::{ENCRYPTED_EVENT_TYPE, RawEvent},
        structs::{JoinRequest, LoginRequest, MessagesRequest, RoomSendRequest},
    },
    media::{AvatarCache, ProfileCache, UserProfile},
    model::{DecryptionStatus, LocalChange, ModelSnapshot, Room, RoomModel},
    session::{
        Notification, NotificationHub, NotificationSink, SessionState, WorkerPool,
        applier::{Applier, LocalChanges},
    },
    store::{CredentialStore, KeyStore, RoomStore, Session, StoreCipher, StoreError},
    sync::{SyncEngine, SyncEvent, SyncHandle, SyncStatus, delta::parse_events},
    utils::{now_millis, transaction_id},
};

/// Builds the transport to a homeserver URL.
pub type Connector = Arc<dyn Fn(&str) -> Result<Arc<dyn Homeserver>, EngineError> + Send + Sync>;

/// Handles shared by the operations of a logged-in session.
#[derive(Clone)]
struct SessionParts {
    user_id: OwnedUserId,
    client: MatrixClient,
    credentials: Arc<CredentialStore>,
    keys: Arc<KeyStore>,
    rooms: Arc<RoomStore>,
    coordinator: Arc<EncryptionCoordinator>,
    local: LocalChanges,
    workers: WorkerPool,
    avatars: Arc<AvatarCache>,
    profiles: Arc<ProfileCache>,
}

type SessionSlot = Mutex<Option<ActiveSession>>;

struct ActiveSession {
    generation: u64,
    parts: SessionParts,
    sync: SyncHandle,
    applier: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl ActiveSession {
    /// Stops the sync loop and the background tasks. The stores are kept.
    async fn stop(self) -> SessionParts {
        self.sync.stop().await;
        self.parts.workers.shutdown();
        if let Err(e) = self.applier.await {
            error!("applier panicked: {}", e);
        }
        if let Err(e) = self.supervisor.await {
            error!("session supervisor panicked: {}", e);
        }
        self.parts
    }

    /// Stops a session whose sync loop failed for good, from its own
    /// supervisor. The supervisor task is left to end by itself.
    async fn retire(self) {
        self.sync.stop().await;
        self.parts.workers.shutdown();
        if let Err(e) = self.applier.await {
            error!("applier panicked: {}", e);
        }
        info!("session of {} ended", self.parts.user_id);
    }
}

/// Removes the session `generation` from `slot` after its sync loop
/// failed, so that a new login can start.
async fn retire_session(slot: &Weak<SessionSlot>, generation: u64) {
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let session = {
        let mut active = slot.lock().await;
        let current = active.as_ref().map(|session| session.generation);
        if current == Some(generation) { active.take() } else { None }
    };
    if let Some(session) = session {
        session.retire().await;
    }
}

/// Session manager.
///
/// There is at most one logged-in session per manager. Its state is
/// published on a watch channel and its changes on the notification feed.
///
/// # Examples
///
/// ```ignore
/// let manager = SessionManager::new(config, data_dir, cache_dir);
/// let mut feed = manager.notifications();
/// match manager.resume().await {
///     Err(EngineError::NotLoggedIn) => manager.login("matrix.org", "alice", "secret").await?,
///     other => other?,
/// }
/// let txn = manager.send_message(&room_id, "hello").await?;
/// ```
pub struct SessionManager {
    config: Config,
    data_dir: PathBuf,
    cache_dir: PathBuf,
    connector: Connector,
    state: watch::Sender<SessionState>,
    snapshots: watch::Sender<Arc<ModelSnapshot>>,
    feed: NotificationHub,
    active: Arc<SessionSlot>,
    generation: AtomicU64,
}

impl SessionManager {
    /// Creates a manager talking HTTPS to the homeserver.
    ///
    /// # Arguments
    ///
    /// * `config` - Engine configuration.
    /// * `data_dir` - Directory of the encrypted stores.
    /// * `cache_dir` - Directory of the avatar cache.
    pub fn new(config: Config, data_dir: &Path, cache_dir: &Path) -> Self {
        let timeout = config.request_timeout();
        let margin = config.sync_settings().client_margin;
        let connector: Connector = Arc::new(move |homeserver: &str| {
            let client = HomeserverClient::new(homeserver, timeout)?.with_sync_margin(margin);
            Ok(Arc::new(client) as Arc<dyn Homeserver>)
        });
        Self::with_connector(config, data_dir, cache_dir, connector)
    }

    /// Creates a manager using `connector` to reach homeservers.
    pub fn with_connector(
        config: Config,
        data_dir: &Path,
        cache_dir: &Path,
        connector: Connector,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::LoggedOut);
        let (snapshots, _) = watch::channel(Arc::new(ModelSnapshot::default()));
        SessionManager {
            config,
            data_dir: data_dir.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            connector,
            state,
            snapshots,
            feed: NotificationHub::new(),
            active: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Latest copy of the room model.
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receives a new snapshot after every applied change.
    pub fn watch_snapshots(&self) -> watch::Receiver<Arc<ModelSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn room_snapshot(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.snapshots.borrow().room(&room_id.to_owned())
    }

    /// Forwards every notification to `sink`.
    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) {
        self.feed.subscribe(sink);
    }

    /// New receiver of the notification feed.
    pub fn notifications(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.feed.receiver()
    }

    fn set_state(&self, next: SessionState) {
        set_state(&self.state, &self.feed, next);
    }

    async fn open_cipher(&self) -> Result<StoreCipher, StoreError> {
        StoreCipher::open(
            &self.data_dir,
            self.config.store.passphrase.as_deref(),
            self.config.kdf_params(),
        )
        .await
    }

    /// Logs in with a password and starts syncing.
    ///
    /// Keys and rooms of a previous session are discarded: a login always
    /// creates a new device. The state stays
    /// [`SessionState::Authenticating`] until the first sync succeeds.
    ///
    /// # Arguments
    ///
    /// * `homeserver` - URL or server name of the homeserver.
    /// * `username` - Localpart or full user id.
    /// * `password` - Account password.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AuthFailed`] if the homeserver refuses the credentials,
    /// - [`EngineError::Transport`] if it cannot be reached,
    /// - [`EngineError::StorageCorruption`] if the local store is unusable.
    pub async fn login(&self, homeserver: &str, username: &str, password: &str) -> Result<(), EngineError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(EngineError::InvalidInput("already logged in".to_owned()));
        }
        self.set_state(SessionState::Authenticating);

        match self.authenticate(homeserver, username, password).await {
            Ok(session) => {
                *active = Some(session);
                Ok(())
            }
            Err(e) => {
                warn!("login failed: {}", e);
                self.set_state(match &e {
                    EngineError::AuthFailed(reason) => SessionState::AuthFailed(reason.clone()),
                    EngineError::StorageCorruption(reason) => SessionState::Fatal(reason.clone()),
                    _ => SessionState::LoggedOut,
                });
                Err(e)
            }
        }
    }

    async fn authenticate(
        &self,
        homeserver_url: &str,
        username: &str,
        password: &str,
    ) -> Result<ActiveSession, EngineError> {
        let cipher = self.open_cipher().await?;
        let homeserver = (self.connector)(homeserver_url)?;

        let request = LoginRequest {
            username: username.to_owned(),
            password: password.to_owned(),
            device_display_name: self.config.device_name.clone(),
        };
        let response = homeserver.login(&request).await.map_err(|e| match e {
            RequestError::Api { .. } | RequestError::UnknownToken { .. } => {
                EngineError::AuthFailed(e.to_string())
            }
            e => e.into(),
        })?;
        info!("logged in as {} on device {}", response.user_id, response.device_id);

        let credentials = Arc::new(CredentialStore::new(&self.data_dir, cipher.clone()));
        let rooms = Arc::new(RoomStore::new(&self.data_dir, cipher.clone()));
        KeyStore::remove(&self.data_dir).await?;
        rooms.clear().await?;
        let keys = Arc::new(
            KeyStore::open(&self.data_dir, &cipher, &response.user_id, &response.device_id).await?,
        );

        let session = Session {
            homeserver: homeserver_url.to_owned(),
            user_id: response.user_id,
            device_id: response.device_id,
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            sync_token: None,
        };
        credentials.save(&session).await?;

        let client = MatrixClient::new(homeserver, credentials.clone());
        let model = RoomModel::new(session.user_id.clone());
        Ok(self.start(client, credentials, keys, rooms, model).await)
    }

    /// Restores the stored session and starts syncing from its cursor.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotLoggedIn`] if no session was stored,
    /// - [`EngineError::StorageCorruption`] if the stores cannot be read.
    pub async fn resume(&self) -> Result<(), EngineError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Ok(());
        }

        match self.restore().await {
            Ok(session) => {
                *active = Some(session);
                Ok(())
            }
            Err(EngineError::NotLoggedIn) => {
                debug!("no session to resume");
                self.set_state(SessionState::LoggedOut);
                Err(EngineError::NotLoggedIn)
            }
            Err(e) => {
                error!("cannot resume the session: {}", e);
                self.set_state(SessionState::Fatal(e.to_string()));
                Err(e)
            }
        }
    }

    async fn restore(&self) -> Result<ActiveSession, EngineError> {
        let cipher = self.open_cipher().await?;
        let credentials = Arc::new(CredentialStore::new(&self.data_dir, cipher.clone()));
        let session = credentials.load().await?;
        info!("resume session of {} from {:?}", session.user_id, session.sync_token);

        let keys = Arc::new(
            KeyStore::open(&self.data_dir, &cipher, &session.user_id, &session.device_id).await?,
        );
        let rooms = Arc::new(RoomStore::new(&self.data_dir, cipher));
        let model = match rooms.load(&session.user_id).await? {
            Some(persisted) => RoomModel::restore(session.user_id.clone(), persisted),
            None => RoomModel::new(session.user_id.clone()),
        };

        let homeserver = (self.connector)(&session.homeserver)?;
        let client = MatrixClient::new(homeserver, credentials.clone());
        Ok(self.start(client, credentials, keys, rooms, model).await)
    }

    /// Starts the sync loop and the background tasks of a session.
    ///
    /// The state becomes [`SessionState::Syncing`] once the supervisor sees
    /// the first successful sync.
    async fn start(
        &self,
        client: MatrixClient,
        credentials: Arc<CredentialStore>,
        keys: Arc<KeyStore>,
        rooms: Arc<RoomStore>,
        model: RoomModel,
    ) -> ActiveSession {
        let user_id = model.own_user_id().clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let workers = WorkerPool::new(self.config.workers.max_concurrent);

        let (warnings_tx, warnings) = mpsc::unbounded_channel();
        let coordinator = Arc::new(EncryptionCoordinator::new(
            client.clone(),
            keys.clone(),
            self.config.encryption_settings(),
            warnings_tx,
        ));
        coordinator.restore_pending(model.undecryptable()).await;
        let uploader = coordinator.clone();
        workers.spawn("key upload", async move {
            if let Err(e) = uploader.send_outgoing_requests().await {
                warn!("key upload failed: {}", e);
            }
        });

        self.set_state(SessionState::Authenticating);
        let (status_tx, statuses) = mpsc::unbounded_channel();
        let (sync, deltas) = SyncEngine::new(client.clone(), self.config.sync_settings()).start(status_tx);

        let applier = Applier {
            user_id: user_id.clone(),
            model,
            rooms: rooms.clone(),
            coordinator: coordinator.clone(),
            workers: workers.clone(),
            snapshots: self.snapshots.clone(),
            feed: self.feed.clone(),
        };
        let (local, applier) = applier.spawn(deltas);

        let supervisor = tokio::spawn(supervise(
            statuses,
            warnings,
            self.state.clone(),
            self.feed.clone(),
            Arc::downgrade(&self.active),
            generation,
        ));

        let avatars = Arc::new(AvatarCache::new(
            &self.cache_dir,
            self.config.media.avatar_size,
            Arc::new(client.clone()),
        ));
        let profiles = Arc::new(
            ProfileCache::open(
                &self.cache_dir,
                self.config.profile_ttl(),
                Arc::new(client.clone()),
            )
            .await,
        );

        ActiveSession {
            generation,
            parts: SessionParts {
                user_id,
                client,
                credentials,
                keys,
                rooms,
                coordinator,
                local,
                workers,
                avatars,
                profiles,
            },
            sync,
            applier,
            supervisor,
        }
    }

    async fn parts(&self) -> Result<SessionParts, EngineError> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.parts.clone())
            .ok_or(EngineError::NotLoggedIn)
    }

    /// Ends the session: stops syncing, revokes the access token when the
    /// homeserver is reachable and deletes every local file of the session.
    pub async fn logout(&self) -> Result<(), EngineError> {
        let Some(active) = self.active.lock().await.take() else {
            return Err(EngineError::NotLoggedIn);
        };
        let parts = active.stop().await;

        if let Err(e) = parts.client.logout().await {
            warn!("failed to revoke the access token: {}", e);
        }
        parts.credentials.clear().await?;
        drop(parts.coordinator);
        drop(parts.keys);
        KeyStore::remove(&self.data_dir).await?;
        parts.rooms.clear().await?;
        if let Err(e) = parts.avatars.clear().await {
            warn!("failed to clear the avatar cache: {}", e);
        }
        if let Err(e) = parts.profiles.clear().await {
            warn!("failed to clear the profile cache: {}", e);
        }

        self.snapshots.send_replace(Arc::new(ModelSnapshot::default()));
        self.set_state(SessionState::LoggedOut);
        info!("logged out {}", parts.user_id);
        Ok(())
    }

    /// Stops the session and keeps it stored for [`SessionManager::resume`].
    pub async fn shutdown(&self) {
        if let Some(active) = self.active.lock().await.take() {
            let parts = active.stop().await;
            info!("session of {} stopped", parts.user_id);
        }
        self.set_state(SessionState::LoggedOut);
    }

    /// Sends a text message.
    ///
    /// The message shows at once as a local echo. The outcome arrives later
    /// as [`Notification::MessageSent`] or [`Notification::MessageSendFailed`].
    ///
    /// # Arguments
    ///
    /// * `room_id` - A room of the model.
    /// * `body` - Text of the message.
    ///
    /// Returns the transaction id of the message.
    pub async fn send_message(&self, room_id: &RoomId, body: &str) -> Result<String, EngineError> {
        if body.trim().is_empty() {
            return Err(EngineError::InvalidInput("empty message".to_owned()));
        }
        let parts = self.parts().await?;
        let room_id = room_id.to_owned();
        let room = self
            .room_snapshot(&room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.clone()))?;

        let transaction_id = transaction_id();
        let content = json!({ "msgtype": "m.text", "body": body });
        parts
            .local
            .apply(LocalChange::Echo {
                room_id: room_id.clone(),
                transaction_id: transaction_id.clone(),
                event_type: "m.room.message".to_owned(),
                content: content.clone(),
                timestamp: now_millis(),
            })
            .await?;

        let encryption = room.encryption.as_ref().map(|encryption| RoomEncryptionContext {
            room_id: room_id.clone(),
            members: room.active_members(),
            rotation: Some(encryption.rotation(self.config.rotation_policy())),
        });
        let feed = self.feed.clone();
        let txn = transaction_id.clone();
        let job_parts = parts.clone();
        parts.workers.spawn("send message", async move {
            let parts = job_parts;
            let result = deliver(&parts, &feed, encryption, &room_id, &txn, content).await;
            let (change, notification) = match result {
                Ok(event_id) => {
                    debug!("message {} sent as {}", txn, event_id);
                    (
                        LocalChange::Sent {
                            room_id: room_id.clone(),
                            transaction_id: txn.clone(),
                            event_id: event_id.clone(),
                        },
                        Notification::MessageSent {
                            room_id,
                            transaction_id: txn,
                            event_id,
                        },
                    )
                }
                Err(e) => {
                    warn!("message {} not sent: {}", txn, e);
                    (
                        LocalChange::SendFailed {
                            room_id: room_id.clone(),
                            transaction_id: txn.clone(),
                            error: e.to_string(),
                        },
                        Notification::MessageSendFailed {
                            room_id,
                            transaction_id: txn,
                            error: e.to_string(),
                        },
                    )
                }
            };
            if let Err(e) = parts.local.apply(change).await {
                warn!("cannot record the send outcome: {}", e);
            }
            feed.publish(notification);
        });

        Ok(transaction_id)
    }

    /// Loads older events of a room.
    ///
    /// The newest gap left by a limited sync is filled first, then the
    /// timeline grows from its start. Returns the number of events received,
    /// `0` once the start of the room is reached.
    pub async fn paginate_back(&self, room_id: &RoomId, limit: u32) -> Result<usize, EngineError> {
        let parts = self.parts().await?;
        let room_id = room_id.to_owned();
        let room = self
            .room_snapshot(&room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.clone()))?;
        let (from, gap) = match (room.gaps.last(), room.prev_batch.clone()) {
            (Some(gap), _) => (gap.prev_batch.clone(), Some(gap.before.clone())),
            (None, Some(from)) => (from, None),
            (None, None) => {
                debug!("start of {} already reached", room_id);
                return Ok(0);
            }
        };

        let (client, coordinator) = (parts.client.clone(), parts.coordinator.clone());
        let request = MessagesRequest {
            room_id: room_id.clone(),
            from,
            limit,
        };
        let (events, end) = parts
            .workers
            .run("paginate", async move {
                let response = client.room_messages(&request).await?;
                let raw: Vec<RawEvent> = parse_events(&request.room_id, response.chunk);
                let mut events = Vec::with_capacity(raw.len());
                for raw in raw {
                    let mut event = SyncEvent::new(raw);
                    if event.raw.is_encrypted() {
                        event.decrypted = Some(match coordinator.decrypt(&request.room_id, &event.raw).await {
                            Ok(decrypted) => Ok(decrypted),
                            Err(EngineError::Decryption(reason)) => Err(reason),
                            Err(e) => return Err(e),
                        });
                    }
                    events.push(event);
                }
                Ok((events, response.end))
            })
            .await?;

        let count = events.len();
        parts
            .local
            .apply(LocalChange::Backfill {
                room_id,
                events,
                end,
                gap,
            })
            .await?;
        Ok(count)
    }

    /// Marks a device as verified, unverified or blacklisted.
    pub async fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: DeviceTrust,
    ) -> Result<(), EngineError> {
        let parts = self.parts().await?;
        parts.keys.set_trust(user_id, device_id, trust).await?;
        info!("{} {} is now {:?}", user_id, device_id, trust);
        Ok(())
    }

    /// Known devices of a user.
    pub async fn devices_of(&self, user_id: &UserId) -> Result<Vec<DeviceKey>, EngineError> {
        let parts = self.parts().await?;
        Ok(parts.keys.devices_of(user_id).await?)
    }

    /// Asks our other devices for the room key of an event still waiting
    /// for it. The event is decrypted when a forwarded key arrives.
    pub async fn request_room_key(&self, room_id: &RoomId, event_id: &EventId) -> Result<(), EngineError> {
        let parts = self.parts().await?;
        let room_id = room_id.to_owned();
        let room = self
            .room_snapshot(&room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.clone()))?;
        let event = room
            .timeline
            .iter()
            .find(|event| event.event_id.as_str() == event_id.as_str())
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown event {}", event_id)))?;
        let raw = match (&event.status, event.encrypted_event()) {
            (DecryptionStatus::Pending(_), Some(raw)) => raw,
            _ => {
                return Err(EngineError::InvalidInput(format!(
                    "{} is not waiting for a room key",
                    event_id
                )));
            }
        };

        let coordinator = parts.coordinator.clone();
        parts
            .workers
            .run("key request", async move { coordinator.request_room_key(&room_id, &raw).await })
            .await
    }

    /// Joins a room by id or alias.
    ///
    /// The room enters the model with the next sync. Returns its id.
    ///
    /// # Arguments
    ///
    /// * `room` - Room id (`!id:server`) or alias (`#alias:server`).
    /// * `via` - Servers to join through.
    pub async fn join_room(&self, room: &str, via: &[String]) -> Result<OwnedRoomId, EngineError> {
        let room = room.trim();
        if !(room.starts_with('!') || room.starts_with('#')) || !room.contains(':') {
            return Err(EngineError::InvalidInput(format!("not a room id or alias: {:?}", room)));
        }
        let parts = self.parts().await?;
        let client = parts.client.clone();
        let request = JoinRequest {
            room: room.to_owned(),
            via: via.to_vec(),
        };
        let response = parts
            .workers
            .run("join", async move { client.join_room(&request).await })
            .await?;
        info!("joined {}", response.room_id);
        Ok(response.room_id)
    }

    /// Display name and avatar of a user, from the cache when fresh.
    pub async fn get_user_profile(&self, user_id: &UserId) -> Result<UserProfile, EngineError> {
        let parts = self.parts().await?;
        let (profiles, user_id) = (parts.profiles.clone(), user_id.to_owned());
        parts
            .workers
            .run("profile", async move { profiles.get(&user_id).await.map_err(EngineError::from) })
            .await
    }

    /// Bytes of an avatar thumbnail, from the cache when possible.
    pub async fn fetch_avatar(&self, mxc: &MxcUri) -> Result<Arc<Vec<u8>>, EngineError> {
        let parts = self.parts().await?;
        let (avatars, mxc) = (parts.avatars.clone(), mxc.to_owned());
        parts
            .workers
            .run("avatar", async move { avatars.fetch(&mxc).await.map_err(EngineError::from) })
            .await
    }
}

fn set_state(state: &watch::Sender<SessionState>, feed: &NotificationHub, next: SessionState) {
    let changed = state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        info!("session state {:?} -> {:?}", current, next);
        *current = next.clone();
        true
    });
    if changed {
        feed.publish(Notification::StateChanged(next));
    }
}

/// Follows the sync loop and the encryption warnings until the loop ends.
///
/// A failed loop ends the session before the failure is published, so the
/// next login finds no session running.
async fn supervise(
    mut statuses: mpsc::UnboundedReceiver<SyncStatus>,
    mut warnings: mpsc::UnboundedReceiver<SecurityWarning>,
    state: watch::Sender<SessionState>,
    feed: NotificationHub,
    active: Weak<SessionSlot>,
    generation: u64,
) {
    loop {
        tokio::select! {
            status = statuses.recv() => {
                let Some(status) = status else { break };
                let next = match status {
                    SyncStatus::Connected => SessionState::Syncing,
                    SyncStatus::Reconnecting { attempt, error } => {
                        SessionState::Reconnecting { attempt, error }
                    }
                    SyncStatus::Failed(e) => {
                        retire_session(&active, generation).await;
                        match e {
                            EngineError::AuthExpired => SessionState::AuthFailed(e.to_string()),
                            e => SessionState::Fatal(e.to_string()),
                        }
                    }
                };
                set_state(&state, &feed, next);
            }
            Some(warning) = warnings.recv() => feed.publish(Notification::SecurityWarning(warning)),
        }
    }
    debug!("session supervisor stopped");
}

/// Encrypts the message if needed and sends it.
async fn deliver(
    parts: &SessionParts,
    feed: &NotificationHub,
    encryption: Option<RoomEncryptionContext>,
    room_id: &OwnedRoomId,
    transaction_id: &str,
    content: serde_json::Value,
) -> Result<matrix_sdk::ruma::OwnedEventId, EngineError> {
    let (event_type, content) = match encryption {
        None => ("m.room.message".to_owned(), content),
        Some(context) => {
            let message = parts
                .coordinator
                .encrypt(&context, "m.room.message", content)
                .await?;
            if !message.withheld.is_empty() {
                feed.publish(Notification::KeysWithheld {
                    room_id: room_id.clone(),
                    devices: message.withheld,
                });
            }
            (ENCRYPTED_EVENT_TYPE.to_owned(), message.content)
        }
    };

    let request = RoomSendRequest {
        room_id: room_id.clone(),
        event_type,
        txn_id: transaction_id.to_owned(),
        content,
    };
    Ok(parts.client.send_message(&request).await?.event_id)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicBool, AtomicUsize},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use matrix_sdk::ruma::{OwnedEventId, OwnedMxcUri};
    use matrix_sdk_crypto::vodozemac::{
        megolm::{GroupSession, SessionConfig},
        olm::Account,
    };
    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        error::DecryptionFailure,
        matrix::{
            response_structs::{
                JoinResponse, KeysClaimResponse, KeysQueryResponse, KeysUploadResponse, LoginResponse,
                MediaResponse, MessagesResponse, ProfileResponse, RefreshResponse, RoomSendResponse,
            },
            structs::{
                KeysClaimRequest, KeysQueryRequest, KeysUploadRequest, MediaRequest, ProfileRequest,
                SyncRequest, ToDeviceRequest,
            },
        },
    };

    const WAIT: Duration = Duration::from_secs(10);

    /// Homeserver replaying scripted sync responses, long-polling while
    /// none is queued.
    #[derive(Default)]
    struct FakeHomeserver {
        syncs: StdMutex<VecDeque<Result<Value, RequestError>>>,
        requested: StdMutex<Vec<Option<String>>>,
        sent: StdMutex<Vec<RoomSendRequest>>,
        to_device: StdMutex<Vec<String>>,
        history: StdMutex<Vec<Value>>,
        paginated: StdMutex<Vec<String>>,
        profile_lookups: AtomicUsize,
        refuse_login: AtomicBool,
        logged_out: AtomicBool,
    }

    impl FakeHomeserver {
        fn new(syncs: Vec<Result<Value, RequestError>>) -> Arc<Self> {
            Arc::new(FakeHomeserver {
                syncs: StdMutex::new(syncs.into()),
                ..Default::default()
            })
        }

        fn sync_requests(&self) -> Vec<Option<String>> {
            self.requested.lock().unwrap().clone()
        }

        fn queue_sync(&self, response: Value) {
            self.syncs.lock().unwrap().push_back(Ok(response));
        }
    }

    #[async_trait]
    impl Homeserver for FakeHomeserver {
        async fn login(&self, _request: &LoginRequest) -> Result<LoginResponse, RequestError> {
            if self.refuse_login.load(Ordering::SeqCst) {
                return Err(RequestError::Api {
                    status: 403,
                    errcode: "M_FORBIDDEN".to_owned(),
                    message: "Invalid password".to_owned(),
                });
            }
            Ok(LoginResponse {
                user_id: OwnedUserId::try_from("@alice:example.org").unwrap(),
                access_token: "token".to_owned(),
                device_id: "ALICEDEV".into(),
                refresh_token: None,
            })
        }

        async fn logout(&self, _access_token: &str) -> Result<(), RequestError> {
            self.logged_out.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshResponse, RequestError> {
            Err(RequestError::UnknownToken { soft_logout: false })
        }

        async fn sync(&self, _access_token: &str, request: &SyncRequest) -> Result<Value, RequestError> {
            self.requested.lock().unwrap().push(request.since.clone());
            loop {
                let next = self.syncs.lock().unwrap().pop_front();
                if let Some(response) = next {
                    return response;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        async fn upload_keys(
            &self,
            _access_token: &str,
            _request: &KeysUploadRequest,
        ) -> Result<KeysUploadResponse, RequestError> {
            Ok(KeysUploadResponse::default())
        }

        async fn query_keys(
            &self,
            _access_token: &str,
            _request: &KeysQueryRequest,
        ) -> Result<KeysQueryResponse, RequestError> {
            Ok(KeysQueryResponse::default())
        }

        async fn claim_keys(
            &self,
            _access_token: &str,
            _request: &KeysClaimRequest,
        ) -> Result<KeysClaimResponse, RequestError> {
            Ok(KeysClaimResponse::default())
        }

        async fn send_to_device(
            &self,
            _access_token: &str,
            request: &ToDeviceRequest,
        ) -> Result<(), RequestError> {
            self.to_device.lock().unwrap().push(request.event_type.clone());
            Ok(())
        }

        async fn send_message(
            &self,
            _access_token: &str,
            request: &RoomSendRequest,
        ) -> Result<RoomSendResponse, RequestError> {
            self.sent.lock().unwrap().push(request.clone());
            Ok(RoomSendResponse {
                event_id: "$sent".try_into().unwrap(),
            })
        }

        async fn room_messages(
            &self,
            _access_token: &str,
            request: &MessagesRequest,
        ) -> Result<MessagesResponse, RequestError> {
            self.paginated.lock().unwrap().push(request.from.clone());
            Ok(MessagesResponse {
                chunk: self.history.lock().unwrap().clone(),
                start: Some("p0".to_owned()),
                end: None,
            })
        }

        async fn download_media(
            &self,
            _access_token: &str,
            _request: &MediaRequest,
        ) -> Result<MediaResponse, RequestError> {
            Err(RequestError::Api {
                status: 404,
                errcode: "M_NOT_FOUND".to_owned(),
                message: String::new(),
            })
        }

        async fn join_room(
            &self,
            _access_token: &str,
            request: &JoinRequest,
        ) -> Result<JoinResponse, RequestError> {
            let room_id = if request.room.starts_with('!') {
                request.room.clone()
            } else {
                "!joined:example.org".to_owned()
            };
            Ok(JoinResponse {
                room_id: OwnedRoomId::try_from(room_id).unwrap(),
            })
        }

        async fn get_profile(
            &self,
            _access_token: &str,
            _request: &ProfileRequest,
        ) -> Result<ProfileResponse, RequestError> {
            self.profile_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(ProfileResponse {
                displayname: Some("Bob".to_owned()),
                avatar_url: None,
            })
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.store.kdf_memory_kib = 64;
        config.store.kdf_iterations = 1;
        config
    }

    fn manager(homeserver: Arc<FakeHomeserver>, dir: &TempDir) -> SessionManager {
        let connector: Connector = Arc::new(move |_: &str| Ok(homeserver.clone() as Arc<dyn Homeserver>));
        SessionManager::with_connector(
            config(),
            &dir.path().join("data"),
            &dir.path().join("cache"),
            connector,
        )
    }

    fn room_id(id: &str) -> OwnedRoomId {
        OwnedRoomId::try_from(id).unwrap()
    }

    fn message(event_id: &str, body: &str) -> Value {
        json!({
            "event_id": event_id,
            "sender": "@bob:example.org",
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": body },
            "origin_server_ts": 1,
        })
    }

    fn two_rooms(cursor: &str) -> Value {
        let state = |name: &str| {
            json!([{
                "event_id": format!("$name-{}", name),
                "sender": "@bob:example.org",
                "type": "m.room.name",
                "state_key": "",
                "content": { "name": name },
                "origin_server_ts": 1,
            }])
        };
        json!({
            "next_batch": cursor,
            "rooms": { "join": {
                "!a:example.org": {
                    "state": { "events": state("A") },
                    "timeline": { "events": [message("$a1", "hello"), message("$a2", "world")], "prev_batch": "p0" },
                },
                "!b:example.org": {
                    "state": { "events": state("B") },
                    "timeline": { "events": [message("$b1", "hi")], "prev_batch": "p0" },
                },
            }},
        })
    }

    async fn wait_for_state(manager: &SessionManager, expected: impl Fn(&SessionState) -> bool) {
        let mut state = manager.watch_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| expected(s)))
            .await
            .expect("state not reached")
            .unwrap();
    }

    /// Sync response with one encrypted event whose room key never arrived.
    fn encrypted_room(cursor: &str) -> Value {
        let mut session = GroupSession::new(SessionConfig::version_1());
        let ciphertext = session.encrypt("{}").to_base64();
        json!({
            "next_batch": cursor,
            "rooms": { "join": { "!secret:example.org": {
                "timeline": { "events": [{
                    "event_id": "$locked",
                    "sender": "@bob:example.org",
                    "type": "m.room.encrypted",
                    "content": {
                        "algorithm": "m.megolm.v1.aes-sha2",
                        "sender_key": Account::new().curve25519_key().to_base64(),
                        "device_id": "BOBDEV",
                        "session_id": session.session_id(),
                        "ciphertext": ciphertext,
                    },
                    "origin_server_ts": 1,
                }], "prev_batch": "p0" },
            }}},
        })
    }

    async fn wait_for_rooms(manager: &SessionManager, count: usize) {
        let mut snapshots = manager.watch_snapshots();
        tokio::time::timeout(WAIT, snapshots.wait_for(|s| s.len() == count))
            .await
            .expect("rooms not synced")
            .unwrap();
    }

    /// Waits until the fake received `count` sync requests.
    async fn wait_for_syncs(homeserver: &FakeHomeserver, count: usize) {
        tokio::time::timeout(WAIT, async {
            while homeserver.sync_requests().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sync not requested");
    }

    async fn next_matching(
        feed: &mut mpsc::UnboundedReceiver<Notification>,
        expected: impl Fn(&Notification) -> bool,
    ) -> Notification {
        tokio::time::timeout(WAIT, async {
            loop {
                let notification = feed.recv().await.expect("feed closed");
                if expected(&notification) {
                    return notification;
                }
            }
        })
        .await
        .expect("notification not received")
    }

    #[tokio::test]
    async fn test_login_syncs_rooms_then_auth_expires() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![
            Ok(two_rooms("s1")),
            Err(RequestError::UnknownToken { soft_logout: false }),
        ]);
        let manager = manager(homeserver.clone(), &dir);
        let mut feed = manager.notifications();

        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_state(&manager, |s| matches!(s, SessionState::AuthFailed(_))).await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.display_name(&room_id("!a:example.org")), "A");
        assert_eq!(
            manager.room_snapshot(&room_id("!a:example.org")).unwrap().timeline.len(),
            2
        );
        assert_eq!(homeserver.sync_requests(), vec![None, Some("s1".to_owned())]);

        let rooms_changed = next_matching(&mut feed, |n| matches!(n, Notification::RoomsChanged { .. })).await;
        let Notification::RoomsChanged { rooms, .. } = rooms_changed else {
            unreachable!()
        };
        assert_eq!(rooms.len(), 2);
    }

    #[tokio::test]
    async fn test_refused_login() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![]);
        homeserver.refuse_login.store(true, Ordering::SeqCst);
        let manager = manager(homeserver, &dir);

        let result = manager.login("https://example.org", "alice", "wrong").await;
        assert!(matches!(result, Err(EngineError::AuthFailed(_))));
        assert!(matches!(manager.state(), SessionState::AuthFailed(_)));
        assert!(matches!(
            manager.send_message(&room_id("!a:example.org"), "hi").await,
            Err(EngineError::NotLoggedIn)
        ));
    }

    #[tokio::test]
    async fn test_resume_without_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(FakeHomeserver::new(vec![]), &dir);
        assert!(matches!(manager.resume().await, Err(EngineError::NotLoggedIn)));
        assert_eq!(manager.state(), SessionState::LoggedOut);
    }

    #[tokio::test]
    async fn test_redelivered_delta_after_crash_adds_nothing() {
        let dir = TempDir::new().unwrap();
        let first = FakeHomeserver::new(vec![Ok(two_rooms("s1"))]);
        let manager_before = manager(first.clone(), &dir);
        manager_before
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_syncs(&first, 2).await;
        let before = manager_before.snapshot();
        manager_before.shutdown().await;

        // Crash between persisting the rooms and the cursor.
        let cipher = StoreCipher::open(&dir.path().join("data"), None, config().kdf_params())
            .await
            .unwrap();
        let credentials = CredentialStore::new(&dir.path().join("data"), cipher);
        let mut session = credentials.load().await.unwrap();
        assert_eq!(session.sync_token.as_deref(), Some("s1"));
        session.sync_token = None;
        credentials.save(&session).await.unwrap();

        let second = FakeHomeserver::new(vec![Ok(two_rooms("s1"))]);
        let manager_after = manager(second.clone(), &dir);
        let mut feed = manager_after.notifications();
        manager_after.resume().await.unwrap();
        assert_eq!(manager_after.snapshot().len(), 2);
        wait_for_syncs(&second, 2).await;

        assert_eq!(second.sync_requests(), vec![None, Some("s1".to_owned())]);
        let after = manager_after.snapshot();
        for room in before.rooms() {
            assert_eq!(after.room(&room.room_id).unwrap().timeline, room.timeline);
        }
        manager_after.shutdown().await;
        while let Ok(notification) = feed.try_recv() {
            assert!(
                !matches!(notification, Notification::NewEvent { .. }),
                "unexpected {:?}",
                notification
            );
        }
    }

    #[tokio::test]
    async fn test_send_message_resolves_echo() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![Ok(two_rooms("s1"))]);
        let manager = manager(homeserver.clone(), &dir);
        let mut feed = manager.notifications();
        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_rooms(&manager, 2).await;

        let room = room_id("!b:example.org");
        assert!(matches!(
            manager.send_message(&room, "   ").await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.send_message(&room_id("!unknown:example.org"), "hi").await,
            Err(EngineError::UnknownRoom(_))
        ));

        let txn = manager.send_message(&room, "hello bob").await.unwrap();
        let sent = next_matching(&mut feed, |n| matches!(n, Notification::MessageSent { .. })).await;
        assert_eq!(
            sent,
            Notification::MessageSent {
                room_id: room.clone(),
                transaction_id: txn.clone(),
                event_id: "$sent".try_into().unwrap(),
            }
        );

        let request = homeserver.sent.lock().unwrap()[0].clone();
        assert_eq!(request.txn_id, txn);
        assert_eq!(request.event_type, "m.room.message");
        assert_eq!(request.content["body"], "hello bob");

        let echo = &manager.room_snapshot(&room).unwrap().pending[0];
        assert_eq!(echo.transaction_id, txn);
        assert_eq!(echo.state, crate::model::EchoState::Sent("$sent".try_into().unwrap()));
    }

    #[tokio::test]
    async fn test_paginate_back_until_start() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![Ok(two_rooms("s1"))]);
        homeserver.history.lock().unwrap().push(message("$old", "first"));
        let manager = manager(homeserver, &dir);
        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_rooms(&manager, 2).await;

        let room = room_id("!b:example.org");
        assert_eq!(manager.paginate_back(&room, 20).await.unwrap(), 1);
        let snapshot = manager.room_snapshot(&room).unwrap();
        assert_eq!(snapshot.timeline[0].event_id.as_str(), "$old");
        assert_eq!(snapshot.prev_batch, None);

        assert_eq!(manager.paginate_back(&room, 20).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_logout_removes_local_state() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![Ok(two_rooms("s1"))]);
        let manager = manager(homeserver.clone(), &dir);
        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_rooms(&manager, 2).await;

        manager.logout().await.unwrap();
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.snapshot().is_empty());
        assert!(homeserver.logged_out.load(Ordering::SeqCst));
        for file in ["session.enc", "crypto", "rooms"] {
            assert!(!dir.path().join("data").join(file).exists(), "{} left behind", file);
        }
        assert!(matches!(manager.logout().await, Err(EngineError::NotLoggedIn)));
        assert!(matches!(manager.resume().await, Err(EngineError::NotLoggedIn)));
    }

    #[tokio::test]
    async fn test_unavailable_avatar() {
        let dir = TempDir::new().unwrap();
        let manager = manager(FakeHomeserver::new(vec![]), &dir);
        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();

        let mxc = OwnedMxcUri::from("mxc://example.org/missing");
        assert!(matches!(
            manager.fetch_avatar(&mxc).await,
            Err(EngineError::Transport(_))
        ));
        assert!(manager.devices_of(&OwnedUserId::try_from("@bob:example.org").unwrap()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_login_again_after_auth_expired() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![
            Ok(two_rooms("s1")),
            Err(RequestError::UnknownToken { soft_logout: false }),
        ]);
        let manager = manager(homeserver.clone(), &dir);
        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_state(&manager, |s| matches!(s, SessionState::AuthFailed(_))).await;
        assert!(matches!(manager.parts().await, Err(EngineError::NotLoggedIn)));

        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        homeserver.queue_sync(two_rooms("s2"));
        wait_for_state(&manager, |s| *s == SessionState::Syncing).await;
        wait_for_rooms(&manager, 2).await;
        let fresh = homeserver.sync_requests().iter().filter(|since| since.is_none()).count();
        assert_eq!(fresh, 2);
    }

    #[tokio::test]
    async fn test_authenticating_until_first_sync() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![]);
        let manager = manager(homeserver.clone(), &dir);
        let mut feed = manager.notifications();

        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_syncs(&homeserver, 1).await;
        assert_eq!(manager.state(), SessionState::Authenticating);

        homeserver.queue_sync(two_rooms("s1"));
        wait_for_state(&manager, |s| *s == SessionState::Syncing).await;
        let first = next_matching(&mut feed, |n| matches!(n, Notification::StateChanged(_))).await;
        assert_eq!(first, Notification::StateChanged(SessionState::Authenticating));
        let next = next_matching(&mut feed, |n| matches!(n, Notification::StateChanged(_))).await;
        assert_eq!(next, Notification::StateChanged(SessionState::Syncing));

        manager.shutdown().await;
        manager.resume().await.unwrap();
        assert_eq!(manager.state(), SessionState::Authenticating);
    }

    #[tokio::test]
    async fn test_resume_keeps_waiting_for_room_keys() {
        let dir = TempDir::new().unwrap();
        let first = FakeHomeserver::new(vec![Ok(encrypted_room("s1"))]);
        let manager_before = manager(first.clone(), &dir);
        manager_before
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_rooms(&manager_before, 1).await;
        let room = room_id("!secret:example.org");
        let locked = manager_before.room_snapshot(&room).unwrap().timeline[0].clone();
        assert_eq!(
            locked.status,
            DecryptionStatus::Pending(DecryptionFailure::NoMatchingSession)
        );
        manager_before.shutdown().await;

        let second = FakeHomeserver::new(vec![]);
        let manager_after = manager(second.clone(), &dir);
        manager_after.resume().await.unwrap();
        let parts = manager_after.parts().await.unwrap();
        assert_eq!(parts.coordinator.pending_events().await, 1);

        manager_after
            .request_room_key(&room, &locked.event_id)
            .await
            .unwrap();
        assert!(second
            .to_device
            .lock()
            .unwrap()
            .iter()
            .any(|event_type| event_type == "m.room_key_request"));
    }

    #[tokio::test]
    async fn test_request_room_key_of_readable_event() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![Ok(two_rooms("s1"))]);
        let manager = manager(homeserver, &dir);
        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_rooms(&manager, 2).await;

        let room = room_id("!a:example.org");
        let readable: OwnedEventId = "$a1".try_into().unwrap();
        let unknown: OwnedEventId = "$nope".try_into().unwrap();
        assert!(matches!(
            manager.request_room_key(&room, &readable).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.request_room_key(&room, &unknown).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_paginate_back_fills_gap_first() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![Ok(two_rooms("s1"))]);
        homeserver.history.lock().unwrap().push(message("$b5", "missed"));
        let manager = manager(homeserver.clone(), &dir);
        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();
        wait_for_rooms(&manager, 2).await;

        let room = room_id("!b:example.org");
        homeserver.queue_sync(json!({
            "next_batch": "s2",
            "rooms": { "join": { "!b:example.org": {
                "timeline": { "events": [message("$b9", "late")], "limited": true, "prev_batch": "gap" },
            }}},
        }));
        let mut snapshots = manager.watch_snapshots();
        tokio::time::timeout(WAIT, snapshots.wait_for(|s| {
            s.room(&room).is_some_and(|room| room.timeline.len() == 2)
        }))
        .await
        .expect("limited sync not applied")
        .unwrap();
        assert_eq!(manager.room_snapshot(&room).unwrap().gaps.len(), 1);

        assert_eq!(manager.paginate_back(&room, 20).await.unwrap(), 1);
        assert_eq!(homeserver.paginated.lock().unwrap().clone(), vec!["gap".to_owned()]);
        let snapshot = manager.room_snapshot(&room).unwrap();
        let ids: Vec<&str> = snapshot.timeline.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$b1", "$b5", "$b9"]);
        assert!(snapshot.gaps.is_empty());

        manager.paginate_back(&room, 20).await.unwrap();
        assert_eq!(homeserver.paginated.lock().unwrap().last().map(String::as_str), Some("p0"));
    }

    #[tokio::test]
    async fn test_join_room_and_profile() {
        let dir = TempDir::new().unwrap();
        let homeserver = FakeHomeserver::new(vec![]);
        let manager = manager(homeserver.clone(), &dir);
        manager
            .login("https://example.org", "alice", "secret")
            .await
            .unwrap();

        assert!(matches!(
            manager.join_room("lobby", &[]).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert_eq!(
            manager.join_room("#lobby:example.org", &[]).await.unwrap(),
            room_id("!joined:example.org")
        );

        let bob = OwnedUserId::try_from("@bob:example.org").unwrap();
        let (first, second) = tokio::join!(manager.get_user_profile(&bob), manager.get_user_profile(&bob));
        assert_eq!(first.unwrap().display_name.as_deref(), Some("Bob"));
        assert_eq!(second.unwrap().display_name.as_deref(), Some("Bob"));
        manager.get_user_profile(&bob).await.unwrap();
        assert_eq!(homeserver.profile_lookups.load(Ordering::SeqCst), 1);
    }
}
