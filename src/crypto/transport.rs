//! Conversions between the requests of the Olm state machine and the wire
//! structures of the [`Homeserver`](crate::matrix::Homeserver) trait.
//!
//! The state machine speaks typed ruma requests. The engine sends JSON
//! through its own mockable transport, so every request is converted on the
//! way out and every response is converted back before it is marked as sent.

use std::collections::BTreeMap;

use log::warn;
use matrix_sdk::ruma::{
    OneTimeKeyAlgorithm, OwnedDeviceId, OwnedOneTimeKeyId, OwnedUserId, UInt,
    api::client::keys::{claim_keys, get_keys, upload_keys},
    serde::Raw,
};
use matrix_sdk_crypto::types::requests::{
    KeysQueryRequest as MachineKeysQuery, ToDeviceRequest as MachineToDevice,
};
use serde::Serialize;
use serde_json::Value;

use crate::{
    error::EngineError,
    matrix::{
        response_structs::{KeysClaimResponse, KeysQueryResponse, KeysUploadResponse},
        structs::{KeysClaimRequest, KeysQueryRequest, KeysUploadRequest, ToDeviceRequest},
    },
};

/// Typed raw JSON of a serializable value.
pub(crate) fn to_raw<T, S: Serialize + ?Sized>(value: &S) -> Result<Raw<T>, EngineError> {
    serde_json::value::to_raw_value(value)
        .map(Raw::from_json)
        .map_err(|e| EngineError::InvalidInput(e.to_string()))
}

/// JSON value of a typed raw JSON.
pub(crate) fn from_raw<T>(raw: &Raw<T>) -> Result<Value, EngineError> {
    serde_json::from_str(raw.json().get()).map_err(|e| EngineError::Protocol(e.to_string()))
}

fn keyed_json<K: ToString, T>(map: &BTreeMap<K, Raw<T>>) -> Result<BTreeMap<String, Value>, EngineError> {
    map.iter()
        .map(|(key, value)| Ok((key.to_string(), from_raw(value)?)))
        .collect()
}

fn raw_by_user<T>(map: &BTreeMap<OwnedUserId, Value>) -> Result<BTreeMap<OwnedUserId, Raw<T>>, EngineError> {
    map.iter()
        .map(|(user_id, value)| Ok((user_id.clone(), to_raw(value)?)))
        .collect()
}

/// One-time key counts as the state machine expects them.
pub(crate) fn key_counts(counts: &BTreeMap<String, u64>) -> BTreeMap<OneTimeKeyAlgorithm, UInt> {
    counts
        .iter()
        .map(|(algorithm, count)| {
            (
                OneTimeKeyAlgorithm::from(algorithm.as_str()),
                UInt::new_saturating(*count),
            )
        })
        .collect()
}

pub(crate) fn key_algorithms(algorithms: &[String]) -> Vec<OneTimeKeyAlgorithm> {
    algorithms
        .iter()
        .map(|algorithm| OneTimeKeyAlgorithm::from(algorithm.as_str()))
        .collect()
}

pub(crate) fn upload_request(request: &upload_keys::v3::Request) -> Result<KeysUploadRequest, EngineError> {
    Ok(KeysUploadRequest {
        device_keys: request.device_keys.as_ref().map(from_raw).transpose()?,
        one_time_keys: keyed_json(&request.one_time_keys)?,
        fallback_keys: keyed_json(&request.fallback_keys)?,
    })
}

pub(crate) fn upload_response(response: &KeysUploadResponse) -> upload_keys::v3::Response {
    upload_keys::v3::Response::new(key_counts(&response.one_time_key_counts))
}

pub(crate) fn query_request(request: &MachineKeysQuery) -> KeysQueryRequest {
    KeysQueryRequest {
        users: request.device_keys.keys().cloned().collect(),
    }
}

pub(crate) fn query_response(response: &KeysQueryResponse) -> Result<get_keys::v3::Response, EngineError> {
    let mut converted = get_keys::v3::Response::new();
    for (user_id, devices) in &response.device_keys {
        let devices = devices
            .iter()
            .map(|(device_id, keys)| Ok((device_id.clone(), to_raw(keys)?)))
            .collect::<Result<BTreeMap<OwnedDeviceId, _>, EngineError>>()?;
        converted.device_keys.insert(user_id.clone(), devices);
    }
    converted.failures = response.failures.clone();
    converted.master_keys = raw_by_user(&response.master_keys)?;
    converted.self_signing_keys = raw_by_user(&response.self_signing_keys)?;
    converted.user_signing_keys = raw_by_user(&response.user_signing_keys)?;
    Ok(converted)
}

pub(crate) fn claim_request(request: &claim_keys::v3::Request) -> KeysClaimRequest {
    KeysClaimRequest {
        devices: request
            .one_time_keys
            .iter()
            .map(|(user_id, devices)| (user_id.clone(), devices.keys().cloned().collect()))
            .collect(),
    }
}

/// Converts a `/keys/claim` response. Keys with an invalid id are skipped.
pub(crate) fn claim_response(response: &KeysClaimResponse) -> Result<claim_keys::v3::Response, EngineError> {
    let mut one_time_keys = BTreeMap::new();
    for (user_id, devices) in &response.one_time_keys {
        let mut by_device = BTreeMap::new();
        for (device_id, keys) in devices {
            let mut by_id = BTreeMap::new();
            for (key_id, key) in keys {
                match OwnedOneTimeKeyId::try_from(key_id.as_str()) {
                    Ok(key_id) => {
                        by_id.insert(key_id, to_raw(key)?);
                    }
                    Err(e) => warn!("skip one-time key {} of {} {}: {}", key_id, user_id, device_id, e),
                }
            }
            by_device.insert(device_id.clone(), by_id);
        }
        one_time_keys.insert(user_id.clone(), by_device);
    }

    let mut converted = claim_keys::v3::Response::new(one_time_keys);
    converted.failures = response.failures.clone();
    Ok(converted)
}

/// Converts a to-device request. Messages for every device of a user are
/// addressed to the `*` device.
pub(crate) fn to_device_request(request: &MachineToDevice) -> Result<ToDeviceRequest, EngineError> {
    let mut messages = BTreeMap::new();
    for (user_id, devices) in &request.messages {
        let devices = devices
            .iter()
            .map(|(device, content)| {
                Ok((OwnedDeviceId::from(device.to_string().as_str()), from_raw(content)?))
            })
            .collect::<Result<BTreeMap<OwnedDeviceId, Value>, EngineError>>()?;
        messages.insert(user_id.clone(), devices);
    }

    Ok(ToDeviceRequest {
        event_type: request.event_type.to_string(),
        txn_id: request.txn_id.to_string(),
        messages,
    })
}
