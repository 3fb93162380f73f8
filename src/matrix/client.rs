//! Authenticated access to the homeserver.
//!
//! This module provides [`MatrixClient`], which reads the access token of the
//! stored session for every call and transparently refreshes it once when the
//! homeserver rejects it.

use std::{future::Future, sync::Arc};

use log::{info, warn};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    error::EngineError,
    matrix::{
        Homeserver, RequestError,
        response_structs::{
            JoinResponse, KeysClaimResponse, KeysQueryResponse, KeysUploadResponse, MediaResponse,
            MessagesResponse, ProfileResponse, RoomSendResponse,
        },
        structs::{
            JoinRequest, KeysClaimRequest, KeysQueryRequest, KeysUploadRequest, MediaRequest,
            MessagesRequest, ProfileRequest, RoomSendRequest, SyncRequest, ToDeviceRequest,
        },
    },
    store::CredentialStore,
};

/// Homeserver access bound to the stored session.
///
/// Cloning is cheap: clones share the transport, the credential store and the
/// refresh lock.
#[derive(Clone)]
pub struct MatrixClient {
    /// Transport to the homeserver
    homeserver: Arc<dyn Homeserver>,
    /// Source of the access and refresh tokens
    credentials: Arc<CredentialStore>,
    /// Serializes token refreshes so a rejected token is refreshed once
    refresh_lock: Arc<Mutex<()>>,
}

impl MatrixClient {
    /// Creates a new [`MatrixClient`].
    ///
    /// # Arguments
    ///
    /// * `homeserver` - Transport to the homeserver.
    /// * `credentials` - Credential store holding the logged-in session.
    pub fn new(homeserver: Arc<dyn Homeserver>, credentials: Arc<CredentialStore>) -> Self {
        MatrixClient {
            homeserver,
            credentials,
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Credential store used by this client.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub async fn sync(&self, request: &SyncRequest) -> Result<Value, EngineError> {
        self.authed(|token| async move { self.homeserver.sync(&token, request).await })
            .await
    }

    pub async fn upload_keys(
        &self,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, EngineError> {
        self.authed(|token| async move { self.homeserver.upload_keys(&token, request).await })
            .await
    }

    pub async fn query_keys(
        &self,
        request: &KeysQueryRequest,
    ) -> Result<KeysQueryResponse, EngineError> {
        self.authed(|token| async move { self.homeserver.query_keys(&token, request).await })
            .await
    }

    pub async fn claim_keys(
        &self,
        request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, EngineError> {
        self.authed(|token| async move { self.homeserver.claim_keys(&token, request).await })
            .await
    }

    pub async fn send_to_device(&self, request: &ToDeviceRequest) -> Result<(), EngineError> {
        self.authed(|token| async move { self.homeserver.send_to_device(&token, request).await })
            .await
    }

    pub async fn send_message(
        &self,
        request: &RoomSendRequest,
    ) -> Result<RoomSendResponse, EngineError> {
        self.authed(|token| async move { self.homeserver.send_message(&token, request).await })
            .await
    }

    pub async fn room_messages(
        &self,
        request: &MessagesRequest,
    ) -> Result<MessagesResponse, EngineError> {
        self.authed(|token| async move { self.homeserver.room_messages(&token, request).await })
            .await
    }

    pub async fn download_media(
        &self,
        request: &MediaRequest,
    ) -> Result<MediaResponse, EngineError> {
        self.authed(|token| async move { self.homeserver.download_media(&token, request).await })
            .await
    }

    pub async fn join_room(&self, request: &JoinRequest) -> Result<JoinResponse, EngineError> {
        self.authed(|token| async move { self.homeserver.join_room(&token, request).await })
            .await
    }

    pub async fn get_profile(
        &self,
        request: &ProfileRequest,
    ) -> Result<ProfileResponse, EngineError> {
        self.authed(|token| async move { self.homeserver.get_profile(&token, request).await })
            .await
    }

    /// Invalidates the access token on the homeserver.
    ///
    /// A token the homeserver already forgot counts as logged out.
    pub async fn logout(&self) -> Result<(), EngineError> {
        let session = self
            .credentials
            .session()
            .await
            .ok_or(EngineError::NotLoggedIn)?;

        match self.homeserver.logout(&session.access_token).await {
            Ok(()) | Err(RequestError::UnknownToken { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `call` with the current access token, refreshing it once if the
    /// homeserver rejects it.
    async fn authed<T, F, Fut>(&self, call: F) -> Result<T, EngineError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let session = self
            .credentials
            .session()
            .await
            .ok_or(EngineError::NotLoggedIn)?;

        match call(session.access_token.clone()).await {
            Err(RequestError::UnknownToken { soft_logout }) => {
                info!("access token rejected, soft logout={}", soft_logout);
                let access_token = self.refresh(&session.access_token).await?;
                call(access_token).await.map_err(EngineError::from)
            }
            result => result.map_err(EngineError::from),
        }
    }

    /// Refreshes the access token.
    ///
    /// When another call already refreshed the rejected token, its result is
    /// reused.
    ///
    /// # Errors
    ///
    /// [`EngineError::AuthExpired`] if the session has no refresh token or the
    /// homeserver rejects it.
    async fn refresh(&self, rejected_token: &str) -> Result<String, EngineError> {
        let _guard = self.refresh_lock.lock().await;

        let session = self
            .credentials
            .session()
            .await
            .ok_or(EngineError::NotLoggedIn)?;
        if session.access_token != rejected_token {
            return Ok(session.access_token);
        }

        let Some(refresh_token) = session.refresh_token else {
            warn!("access token expired and no refresh token is available");
            return Err(EngineError::AuthExpired);
        };

        match self.homeserver.refresh(&refresh_token).await {
            Ok(response) => {
                let refresh_token = response.refresh_token.or(Some(refresh_token));
                let session = self
                    .credentials
                    .update_tokens(response.access_token, refresh_token)
                    .await?;
                info!("access token refreshed");
                Ok(session.access_token)
            }
            Err(RequestError::UnknownToken { .. })
            | Err(RequestError::Api {
                status: 401 | 403, ..
            }) => {
                warn!("refresh token rejected");
                Err(EngineError::AuthExpired)
            }
            Err(e) => Err(e.into()),
        }
    }
}
