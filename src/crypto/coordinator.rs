//! Encryption of outgoing and decryption of incoming room events.
//!
//! This module provides the [`EncryptionCoordinator`], which connects the
//! [`OlmMachine`] of the [`KeyStore`] to the homeserver and to the sync
//! deltas:
//!
//! - incoming to-device messages, device list changes and key counts are
//!   handed to the state machine, then the room keys it imported are retried
//!   against the events waiting for them,
//! - incoming room events are decrypted, checked against replays and buffered
//!   when their key has not arrived yet,
//! - outgoing room events are encrypted after the room key was shared with
//!   the current devices of the members,
//! - the requests of the state machine (key uploads, device queries, key
//!   claims, to-device messages) are sent outside of delta processing.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use log::{debug, info, warn};
use matrix_sdk::{
    deserialized_responses::{AlgorithmInfo, ProcessedToDeviceEvent, VerificationState},
    ruma::{
        OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, TransactionId,
        api::client::{sync::sync_events::DeviceLists, to_device::send_event_to_device},
        serde::Raw,
    },
};
use matrix_sdk_crypto::{
    CollectStrategy, CryptoStoreError, DecryptionSettings, EncryptionSettings as ShareSettings,
    EncryptionSyncChanges, MegolmError, OlmError, OlmMachine, TrustRequirement,
    types::requests::{AnyOutgoingRequest, KeysQueryRequest, ToDeviceRequest as MachineToDevice},
    vodozemac::megolm::{DecryptionError, MegolmMessage},
};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::{
    crypto::{
        DeviceTrust, ROOM_KEY_TYPES, ROOM_KEY_WITHHELD_TYPE, RotationPolicy, SecurityWarning,
        UndecryptableBuffer,
        buffer::PendingEvent,
        transport,
    },
    error::{DecryptionFailure, EngineError},
    matrix::{
        MatrixClient,
        events::RawEvent,
        response_structs::KeysQueryResponse,
        structs::ToDeviceRequest,
    },
    store::{KeyStore, StoreError},
    sync::delta::{LateDecryption, SyncDelta},
};

/// Settings of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionSettings {
    /// Rotation of outbound sessions when the room does not override it.
    pub rotation: RotationPolicy,
    /// Share room keys with verified devices only.
    pub only_verified_devices: bool,
    /// Ask our other devices for missing room keys.
    pub room_key_requests: bool,
    /// Answer key requests of our own verified devices.
    pub room_key_forwarding: bool,
    /// Capacity of the buffer of events waiting for their key.
    pub buffer_size: usize,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        EncryptionSettings {
            rotation: RotationPolicy::default(),
            only_verified_devices: false,
            room_key_requests: true,
            room_key_forwarding: true,
            buffer_size: 1024,
        }
    }
}

/// A successfully decrypted room event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedEvent {
    pub event_type: String,
    pub content: Value,
    /// Identity key of the sending device.
    pub sender_key: String,
    /// Sending device, if it is known.
    pub sender_device: Option<OwnedDeviceId>,
    pub session_id: String,
    pub message_index: u32,
    /// Whether the sending device is verified.
    pub verified: bool,
}

/// Why a device did not receive a room key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WithheldReason {
    /// The device is blacklisted.
    Blacklisted,
    /// Only verified devices receive keys and this one is not.
    Unverified,
    /// No one-time key of the device could be claimed.
    NoOlmSession,
    /// The key could not be delivered. It is sent again with the next message.
    Unavailable,
}

impl WithheldReason {
    /// Reason of an `m.room_key.withheld` code.
    fn from_code(code: &str) -> Self {
        match code {
            "m.blacklisted" => WithheldReason::Blacklisted,
            "m.unverified" | "m.unauthorised" => WithheldReason::Unverified,
            "m.no_olm" => WithheldReason::NoOlmSession,
            _ => WithheldReason::Unavailable,
        }
    }
}

impl fmt::Display for WithheldReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            WithheldReason::Blacklisted => "blacklisted",
            WithheldReason::Unverified => "unverified",
            WithheldReason::NoOlmSession => "no olm session",
            WithheldReason::Unavailable => "unavailable",
        };
        f.write_str(reason)
    }
}

/// A device left out of a room key share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithheldDevice {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub reason: WithheldReason,
}

/// Result of encrypting a room event.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedMessage {
    /// Content of the `m.room.encrypted` event to send.
    pub content: Value,
    pub session_id: String,
    pub message_index: u32,
    /// Devices of members newly left out of the room key.
    pub withheld: Vec<WithheldDevice>,
}

/// What [`EncryptionCoordinator::encrypt`] needs to know about a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEncryptionContext {
    pub room_id: OwnedRoomId,
    /// Joined and invited members.
    pub members: BTreeSet<OwnedUserId>,
    /// Rotation parameters of the room `m.room.encryption` event.
    pub rotation: Option<RotationPolicy>,
}

fn decryption_settings() -> DecryptionSettings {
    DecryptionSettings {
        sender_device_trust_requirement: TrustRequirement::Untrusted,
    }
}

fn store_error(error: CryptoStoreError) -> EngineError {
    StoreError::from(error).into()
}

fn olm_error(error: OlmError) -> EngineError {
    match error {
        OlmError::Store(e) => store_error(e),
        e => EngineError::Protocol(e.to_string()),
    }
}

fn megolm_error(error: MegolmError) -> EngineError {
    match error {
        MegolmError::Store(e) => store_error(e),
        MegolmError::MissingRoomKey(_) => {
            EngineError::Decryption(DecryptionFailure::NoMatchingSession)
        }
        MegolmError::Decryption(DecryptionError::UnknownMessageIndex(..)) => {
            EngineError::Decryption(DecryptionFailure::RatchetExhausted)
        }
        _ => EngineError::Decryption(DecryptionFailure::MalformedCiphertext),
    }
}

/// Message index of a Megolm ciphertext.
fn message_index(content: &Value) -> Option<u32> {
    let ciphertext = content["ciphertext"].as_str()?;
    MegolmMessage::from_base64(ciphertext)
        .ok()
        .map(|message| message.message_index())
}

/// The encrypted event with its room, as the state machine reads it.
fn encrypted_event<T>(room_id: &RoomId, event: &RawEvent) -> Result<Raw<T>, EngineError> {
    let mut value = serde_json::to_value(event).map_err(|e| EngineError::InvalidInput(e.to_string()))?;
    value["room_id"] = Value::from(room_id.as_str());
    transport::to_raw(&value)
}

/// Recipients of a to-device request.
fn recipients(request: &ToDeviceRequest) -> impl Iterator<Item = (&OwnedUserId, &OwnedDeviceId, &Value)> {
    request.messages.iter().flat_map(|(user_id, devices)| {
        devices
            .iter()
            .map(move |(device_id, content)| (user_id, device_id, content))
    })
}

/// Encryption coordinator.
///
/// # Examples
///
/// ```ignore
/// let (warnings_tx, mut warnings) = mpsc::unbounded_channel();
/// let coordinator = EncryptionCoordinator::new(client, keys, settings, warnings_tx);
/// coordinator.after_sync().await?;
///
/// let message = coordinator.encrypt(&context, "m.room.message", content).await?;
/// ```
pub struct EncryptionCoordinator {
    client: MatrixClient,
    keys: Arc<KeyStore>,
    settings: EncryptionSettings,
    buffer: Mutex<UndecryptableBuffer>,
    /// Senders of decrypted events whose device is not known yet
    unknown_senders: Mutex<BTreeSet<OwnedUserId>>,
    /// Serializes the sharing of room keys
    share_lock: Mutex<()>,
    /// Serializes the requests of the state machine
    outgoing_lock: Mutex<()>,
    warnings: mpsc::UnboundedSender<SecurityWarning>,
}

impl EncryptionCoordinator {
    /// Creates a new [`EncryptionCoordinator`].
    ///
    /// # Arguments
    ///
    /// * `client` - Authenticated homeserver access.
    /// * `keys` - Key store of the logged-in device.
    /// * `settings` - Rotation, trust, key request and buffer settings.
    /// * `warnings` - Receives the security warnings.
    pub fn new(
        client: MatrixClient,
        keys: Arc<KeyStore>,
        settings: EncryptionSettings,
        warnings: mpsc::UnboundedSender<SecurityWarning>,
    ) -> Self {
        keys.machine()
            .set_room_key_requests_enabled(settings.room_key_requests);
        keys.machine()
            .set_room_key_forwarding_enabled(settings.room_key_forwarding);

        EncryptionCoordinator {
            client,
            keys,
            settings,
            buffer: Mutex::new(UndecryptableBuffer::new(settings.buffer_size)),
            unknown_senders: Mutex::new(BTreeSet::new()),
            share_lock: Mutex::new(()),
            outgoing_lock: Mutex::new(()),
            warnings,
        }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    fn machine(&self) -> &OlmMachine {
        self.keys.machine()
    }

    fn warn(&self, warning: SecurityWarning) {
        warn!("security warning: {:?}", warning);
        // Nobody listening is not an error.
        let _ = self.warnings.send(warning);
    }

    /// Sends every request the state machine has pending: key uploads,
    /// device list queries, key requests and forwarded keys.
    pub async fn send_outgoing_requests(&self) -> Result<(), EngineError> {
        let _outgoing = self.outgoing_lock.lock().await;
        let requests = self
            .machine()
            .outgoing_requests()
            .await
            .map_err(store_error)?;
        for request in requests {
            self.send_request(request.request_id(), request.request())
                .await?;
        }
        Ok(())
    }

    async fn send_request(
        &self,
        request_id: &TransactionId,
        request: &AnyOutgoingRequest,
    ) -> Result<(), EngineError> {
        match request {
            AnyOutgoingRequest::KeysUpload(request) => {
                let response = self
                    .client
                    .upload_keys(&transport::upload_request(request)?)
                    .await?;
                debug!("server holds {:?} one-time keys", response.one_time_key_counts);
                self.machine()
                    .mark_request_as_sent(request_id, &transport::upload_response(&response))
                    .await
                    .map_err(olm_error)
            }
            AnyOutgoingRequest::KeysQuery(request) => self.send_keys_query(request_id, request).await,
            AnyOutgoingRequest::KeysClaim(request) => {
                let response = self
                    .client
                    .claim_keys(&transport::claim_request(request))
                    .await?;
                self.machine()
                    .mark_request_as_sent(request_id, &transport::claim_response(&response)?)
                    .await
                    .map_err(olm_error)
            }
            AnyOutgoingRequest::ToDeviceRequest(request) => {
                self.client
                    .send_to_device(&transport::to_device_request(request)?)
                    .await?;
                self.machine()
                    .mark_request_as_sent(request_id, &send_event_to_device::v3::Response::new())
                    .await
                    .map_err(olm_error)
            }
            other => {
                debug!("skip unsupported request {}: {:?}", request_id, other);
                Ok(())
            }
        }
    }

    /// Queries device keys, raising a warning for every known device that
    /// published different keys. Such a device loses its verification.
    async fn send_keys_query(
        &self,
        request_id: &TransactionId,
        request: &KeysQueryRequest,
    ) -> Result<(), EngineError> {
        let response = self
            .client
            .query_keys(&transport::query_request(request))
            .await?;
        for failure in response.failures.keys() {
            warn!("device key query failed for {}", failure);
        }

        let changed = self.changed_devices(&response).await?;
        self.machine()
            .mark_request_as_sent(request_id, &transport::query_response(&response)?)
            .await
            .map_err(olm_error)?;

        for (user_id, device_id, trust) in changed {
            if trust == DeviceTrust::Verified {
                self.keys
                    .set_trust(&user_id, &device_id, DeviceTrust::Unverified)
                    .await?;
            }
            self.warn(SecurityWarning::DeviceKeyChanged { user_id, device_id });
        }
        Ok(())
    }

    /// Known devices whose keys differ in a `/keys/query` response, with
    /// their trust before the change.
    async fn changed_devices(
        &self,
        response: &KeysQueryResponse,
    ) -> Result<Vec<(OwnedUserId, OwnedDeviceId, DeviceTrust)>, EngineError> {
        let mut changed = Vec::new();
        for (user_id, devices) in &response.device_keys {
            for (device_id, keys) in devices {
                if user_id.as_str() == self.machine().user_id().as_str()
                    && device_id.as_str() == self.machine().device_id().as_str()
                {
                    continue;
                }
                let Some(known) = self.keys.device(user_id, device_id).await? else {
                    continue;
                };
                let published = |algorithm: &str| {
                    keys["keys"][format!("{}:{}", algorithm, device_id).as_str()].as_str()
                };
                let differs = |published: Option<&str>, known: &str| {
                    published.is_some_and(|key| key != known)
                };
                if differs(published("curve25519"), &known.curve25519)
                    || differs(published("ed25519"), &known.ed25519)
                {
                    changed.push((user_id.clone(), device_id.clone(), known.trust));
                }
            }
        }
        Ok(changed)
    }

    /// Claims one-time keys for the devices of `users` we have no Olm
    /// session with, and for the devices waiting for a forwarded key.
    async fn claim_missing_sessions(&self, users: &BTreeSet<OwnedUserId>) -> Result<(), EngineError> {
        let missing = self
            .machine()
            .get_missing_sessions(users.iter().map(std::ops::Deref::deref))
            .await
            .map_err(store_error)?;
        let Some((request_id, request)) = missing else {
            return Ok(());
        };

        let response = self
            .client
            .claim_keys(&transport::claim_request(&request))
            .await?;
        self.machine()
            .mark_request_as_sent(&request_id, &transport::claim_response(&response)?)
            .await
            .map_err(olm_error)
    }

    /// Starts following the device lists of room members.
    pub async fn update_tracked_users(&self, users: &BTreeSet<OwnedUserId>) -> Result<(), EngineError> {
        self.machine()
            .update_tracked_users(users.iter().map(std::ops::Deref::deref))
            .await
            .map_err(store_error)
    }

    /// Downloads and records the device keys of users now.
    pub async fn query_keys(&self, users: Vec<OwnedUserId>) -> Result<(), EngineError> {
        if users.is_empty() {
            return Ok(());
        }
        let users: BTreeSet<OwnedUserId> = users.into_iter().collect();
        self.update_tracked_users(&users).await?;

        let _outgoing = self.outgoing_lock.lock().await;
        let (request_id, request) = self
            .machine()
            .query_keys_for_users(users.iter().map(std::ops::Deref::deref));
        self.send_keys_query(&request_id, &request).await
    }

    /// Background work after a sync: key upload, outdated device lists and
    /// senders of unknown devices, key requests and answers to the key
    /// requests of our other devices.
    pub async fn after_sync(&self) -> Result<(), EngineError> {
        let unknown = std::mem::take(&mut *self.unknown_senders.lock().await);
        if !unknown.is_empty() {
            debug!("track {} senders of unknown devices", unknown.len());
            self.update_tracked_users(&unknown).await?;
        }
        self.claim_missing_sessions(&BTreeSet::new()).await?;
        self.send_outgoing_requests().await
    }

    /// Decrypts the to-device messages and room events of a delta.
    ///
    /// To-device messages go first so a room key and the events it unlocks
    /// can arrive in the same delta. Events whose key is still missing are
    /// buffered; buffered events unlocked by new keys are reported in
    /// [`SyncDelta::late_decryptions`], as are the ones evicted from a full
    /// buffer.
    ///
    /// Nothing is sent to the homeserver here: device lists that changed are
    /// queried by [`EncryptionCoordinator::after_sync`].
    ///
    /// # Errors
    ///
    /// Only storage failures are returned. Decryption failures are recorded
    /// on the events.
    pub async fn prepare_delta(&self, delta: &mut SyncDelta) -> Result<(), EngineError> {
        let to_device_events = delta
            .to_device
            .iter()
            .filter_map(|event| match transport::to_raw(event) {
                Ok(raw) => Some(raw),
                Err(e) => {
                    warn!("skip to-device event from {}: {}", event.sender, e);
                    None
                }
            })
            .collect();
        let mut changed_devices = DeviceLists::new();
        changed_devices.changed = delta.device_lists_changed.clone();
        changed_devices.left = delta.device_lists_left.clone();
        let one_time_keys_counts = transport::key_counts(&delta.one_time_key_counts);
        let unused_fallback_keys = delta
            .unused_fallback_keys
            .as_deref()
            .map(transport::key_algorithms);

        let (events, room_keys) = self
            .machine()
            .receive_sync_changes(
                EncryptionSyncChanges {
                    to_device_events,
                    changed_devices: &changed_devices,
                    one_time_keys_counts: &one_time_keys_counts,
                    unused_fallback_keys: unused_fallback_keys.as_deref(),
                    next_batch_token: Some(delta.cursor.clone()),
                },
                &decryption_settings(),
            )
            .await
            .map_err(olm_error)?;

        for event in &events {
            self.inspect_to_device(event).await?;
        }

        let mut unlocked: Vec<String> = room_keys.into_iter().map(|key| key.session_id).collect();
        unlocked.sort();
        unlocked.dedup();
        for session_id in unlocked {
            let pending = self.buffer.lock().await.take_for_session(&session_id);
            for pending in pending {
                match self.decrypt(&pending.room_id, &pending.event).await {
                    Err(EngineError::Decryption(DecryptionFailure::NoMatchingSession)) => {
                        self.buffer_event(pending, &mut delta.late_decryptions).await;
                    }
                    Err(EngineError::Decryption(failure)) => {
                        delta.late_decryptions.push(LateDecryption {
                            room_id: pending.room_id,
                            event_id: pending.event.event_id,
                            result: Err(failure),
                        });
                    }
                    Err(e) => return Err(e),
                    Ok(decrypted) => {
                        debug!("late decryption of {}", pending.event.event_id);
                        delta.late_decryptions.push(LateDecryption {
                            room_id: pending.room_id,
                            event_id: pending.event.event_id,
                            result: Ok(decrypted),
                        });
                    }
                }
            }
        }

        let mut late = Vec::new();
        for room in &mut delta.rooms {
            for event in &mut room.timeline {
                if !event.raw.is_encrypted() {
                    continue;
                }
                let result = match self.decrypt(&room.room_id, &event.raw).await {
                    Ok(decrypted) => Ok(decrypted),
                    Err(EngineError::Decryption(failure)) => Err(failure),
                    Err(e) => return Err(e),
                };
                if result == Err(DecryptionFailure::NoMatchingSession) {
                    let pending = PendingEvent::new(room.room_id.clone(), event.raw.clone());
                    self.buffer_event(pending, &mut late).await;
                }
                event.decrypted = Some(result);
            }
        }
        delta.late_decryptions.extend(late);
        Ok(())
    }

    /// Raises warnings for to-device messages that could not be opened and
    /// for room keys sent by blacklisted devices.
    async fn inspect_to_device(&self, event: &ProcessedToDeviceEvent) -> Result<(), EngineError> {
        match event {
            ProcessedToDeviceEvent::UnableToDecrypt { encrypted_event, .. } => {
                if let Ok(Some(user_id)) = encrypted_event.get_field::<OwnedUserId>("sender") {
                    self.warn(SecurityWarning::RoomKeyRejected {
                        user_id,
                        device_id: None,
                        reason: "cannot decrypt the to-device message".to_owned(),
                    });
                }
            }
            ProcessedToDeviceEvent::Decrypted { raw, encryption_info } => {
                let event_type = raw.get_field::<String>("type").ok().flatten().unwrap_or_default();
                if !ROOM_KEY_TYPES.contains(&event_type.as_str()) {
                    return Ok(());
                }
                let Some(device_id) = &encryption_info.sender_device else {
                    return Ok(());
                };
                let device = self.keys.device(&encryption_info.sender, device_id).await?;
                if device.is_some_and(|device| device.trust == DeviceTrust::Blacklisted) {
                    self.warn(SecurityWarning::RoomKeyRejected {
                        user_id: encryption_info.sender.clone(),
                        device_id: Some(device_id.clone()),
                        reason: "device is blacklisted".to_owned(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn buffer_event(&self, pending: PendingEvent, late: &mut Vec<LateDecryption>) {
        debug!(
            "buffer {} until session {} arrives",
            pending.event.event_id, pending.session_id
        );
        if let Some(evicted) = self.buffer.lock().await.push(pending) {
            late.push(LateDecryption {
                room_id: evicted.room_id,
                event_id: evicted.event.event_id,
                result: Err(DecryptionFailure::NoMatchingSession),
            });
        }
    }

    /// Buffers events restored from the room store that still wait for
    /// their key.
    pub async fn restore_pending(&self, events: Vec<PendingEvent>) {
        let mut buffer = self.buffer.lock().await;
        let count = events.len();
        for pending in events {
            if let Some(evicted) = buffer.push(pending) {
                debug!("drop restored event {}, buffer full", evicted.event.event_id);
            }
        }
        if count > 0 {
            info!("{} restored events wait for their room key", count);
        }
    }

    /// Number of events waiting for their room key.
    pub async fn pending_events(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Decrypts a room event.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Decryption`] with the reason the event cannot be read,
    /// - [`EngineError::StorageCorruption`] if the replay index cannot be
    ///   persisted.
    pub async fn decrypt(&self, room_id: &RoomId, event: &RawEvent) -> Result<DecryptedEvent, EngineError> {
        let malformed = EngineError::Decryption(DecryptionFailure::MalformedCiphertext);

        let raw = encrypted_event(room_id, event)?;
        let decrypted = self
            .machine()
            .decrypt_room_event(&raw, room_id, &decryption_settings())
            .await
            .map_err(|e| {
                debug!("cannot decrypt {}: {}", event.event_id, e);
                megolm_error(e)
            })?;
        let info = &decrypted.encryption_info;

        let session_id = info.session_id().unwrap_or_default().to_owned();
        let sender_key = match &info.algorithm_info {
            AlgorithmInfo::MegolmV1AesSha2 { curve25519_key, .. } => curve25519_key.clone(),
            _ => String::new(),
        };
        let Some(message_index) = message_index(&event.content) else {
            return Err(malformed);
        };
        let sender_device = info.sender_device.clone().or_else(|| {
            event.content["device_id"]
                .as_str()
                .map(OwnedDeviceId::from)
        });

        let device = match &sender_device {
            Some(device_id) => self.keys.device(&event.sender, device_id).await?,
            None => None,
        };
        if device.is_none() {
            self.unknown_senders.lock().await.insert(event.sender.clone());
        }
        if device
            .as_ref()
            .is_some_and(|device| device.trust == DeviceTrust::Blacklisted)
        {
            debug!("refuse {} from a blacklisted device", event.event_id);
            return Err(EngineError::Decryption(DecryptionFailure::BlacklistedSender));
        }

        if !self
            .keys
            .check_and_record_index(room_id, &session_id, message_index, &event.event_id)
            .await?
        {
            self.warn(SecurityWarning::ReplayDetected {
                room_id: room_id.to_owned(),
                event_id: event.event_id.clone(),
                session_id,
                message_index,
            });
            return Err(EngineError::Decryption(DecryptionFailure::ReplayDetected));
        }

        let cleartext = transport::from_raw(&decrypted.event).map_err(|_| malformed)?;
        let Some(event_type) = cleartext["type"].as_str() else {
            return Err(EngineError::Decryption(DecryptionFailure::MalformedCiphertext));
        };
        Ok(DecryptedEvent {
            event_type: event_type.to_owned(),
            content: cleartext["content"].clone(),
            sender_key,
            sender_device,
            session_id,
            message_index,
            verified: matches!(info.verification_state, VerificationState::Verified)
                || device.is_some_and(|device| device.trust == DeviceTrust::Verified),
        })
    }

    /// Asks our other devices for the room key of an event, cancelling a
    /// previous request for the same session first.
    pub async fn request_room_key(&self, room_id: &RoomId, event: &RawEvent) -> Result<(), EngineError> {
        let raw = encrypted_event(room_id, event)?;
        let (cancel, request) = self
            .machine()
            .request_room_key(&raw, room_id)
            .await
            .map_err(megolm_error)?;

        let _outgoing = self.outgoing_lock.lock().await;
        if let Some(cancel) = cancel {
            self.send_request(cancel.request_id(), cancel.request())
                .await?;
        }
        info!("request the room key of {} in {}", event.event_id, room_id);
        self.send_request(request.request_id(), request.request())
            .await
    }

    /// Encrypts a room event, rotating and sharing the room key first when
    /// needed.
    ///
    /// A device whose key could not be delivered is reported as withheld
    /// with [`WithheldReason::Unavailable`] and not marked as holding the
    /// key, so it is sent again with the next message.
    ///
    /// # Arguments
    ///
    /// * `room` - The room and its current members.
    /// * `event_type` - Type of the cleartext event.
    /// * `content` - Content of the cleartext event.
    pub async fn encrypt(
        &self,
        room: &RoomEncryptionContext,
        event_type: &str,
        content: Value,
    ) -> Result<EncryptedMessage, EngineError> {
        let _share = self.share_lock.lock().await;
        let room_id = &room.room_id;

        self.update_tracked_users(&room.members).await?;
        self.send_outgoing_requests().await?;
        self.claim_missing_sessions(&room.members).await?;

        let policy = room.rotation.unwrap_or(self.settings.rotation);
        let mut settings = ShareSettings::default();
        settings.rotation_period = Duration::from_millis(policy.max_age_ms);
        settings.rotation_period_msgs = u64::from(policy.max_messages);
        settings.sharing_strategy = if self.settings.only_verified_devices {
            CollectStrategy::OnlyTrustedDevices
        } else {
            CollectStrategy::AllDevices
        };

        let requests = self
            .machine()
            .share_room_key(room_id, room.members.iter().map(std::ops::Deref::deref), settings)
            .await
            .map_err(olm_error)?;
        let mut withheld = Vec::new();
        for request in requests {
            withheld.extend(self.send_room_key(&request).await?);
        }
        if !withheld.is_empty() {
            debug!("{} devices withheld from {}", withheld.len(), room_id);
        }

        let encrypted = self
            .machine()
            .encrypt_room_event_raw(room_id, event_type, &transport::to_raw(&content)?)
            .await
            .map_err(|e| match e {
                MegolmError::Store(e) => store_error(e),
                e => EngineError::Protocol(e.to_string()),
            })?;
        let content = transport::from_raw(&encrypted)?;

        Ok(EncryptedMessage {
            session_id: content["session_id"].as_str().unwrap_or_default().to_owned(),
            message_index: message_index(&content).unwrap_or_default(),
            content,
            withheld,
        })
    }

    /// Sends one room key request of [`OlmMachine::share_room_key`].
    ///
    /// Returns the devices it tells they will not receive the key, or the
    /// devices it could not reach.
    async fn send_room_key(&self, request: &MachineToDevice) -> Result<Vec<WithheldDevice>, EngineError> {
        let wire = transport::to_device_request(request)?;
        let withheld_notice = wire.event_type == ROOM_KEY_WITHHELD_TYPE;

        match self.client.send_to_device(&wire).await {
            Ok(()) => {
                self.machine()
                    .mark_request_as_sent(&request.txn_id, &send_event_to_device::v3::Response::new())
                    .await
                    .map_err(olm_error)?;
            }
            Err(e) if e.is_retryable() => {
                warn!("{} not delivered: {}", wire.event_type, e);
                if !withheld_notice {
                    return Ok(recipients(&wire)
                        .map(|(user_id, device_id, _)| WithheldDevice {
                            user_id: user_id.clone(),
                            device_id: device_id.clone(),
                            reason: WithheldReason::Unavailable,
                        })
                        .collect());
                }
            }
            Err(e) => return Err(e),
        }

        if !withheld_notice {
            info!(
                "shared room key with {} devices",
                recipients(&wire).count()
            );
            return Ok(Vec::new());
        }
        Ok(recipients(&wire)
            .map(|(user_id, device_id, content)| WithheldDevice {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
                reason: WithheldReason::from_code(content["code"].as_str().unwrap_or_default()),
            })
            .collect())
    }
}
