//! HTTP client for the Matrix client-server API.
//!
//! This module provides the [`Homeserver`] trait, the seam between the engine
//! and the network, and [`HomeserverClient`], its `reqwest` implementation.
//! Tests replace the network with the generated `MockHomeserver`.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace};
use mockall::automock;
use reqwest::{Client, Response, StatusCode, Url, header::CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::matrix::{
    RequestError,
    response_structs::{
        ErrorResponse, JoinResponse, KeysClaimResponse, KeysQueryResponse, KeysUploadResponse,
        LoginResponse, MediaResponse, MessagesResponse, ProfileResponse, RefreshResponse,
        RoomSendResponse,
    },
    structs::{
        JoinRequest, KeysClaimRequest, KeysQueryRequest, KeysUploadRequest, LoginRequest,
        MediaRequest, MessagesRequest, ProfileRequest, RoomSendRequest, SyncRequest,
        ToDeviceRequest,
    },
};

/// Operations the engine performs against a homeserver.
///
/// Every authenticated call takes the access token explicitly: token storage
/// and refresh belong to [`crate::matrix::MatrixClient`].
#[automock]
#[async_trait]
pub trait Homeserver: Send + Sync {
    /// Logs in with a password and creates a new device.
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, RequestError>;
    /// Invalidates the access token and its device.
    async fn logout(&self, access_token: &str) -> Result<(), RequestError>;
    /// Exchanges a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, RequestError>;
    /// Long-polls for the next sync response, returned as raw JSON.
    async fn sync(&self, access_token: &str, request: &SyncRequest) -> Result<Value, RequestError>;
    /// Publishes device keys and one-time keys.
    async fn upload_keys(
        &self,
        access_token: &str,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, RequestError>;
    /// Downloads the device keys of users.
    async fn query_keys(
        &self,
        access_token: &str,
        request: &KeysQueryRequest,
    ) -> Result<KeysQueryResponse, RequestError>;
    /// Claims one one-time key per device.
    async fn claim_keys(
        &self,
        access_token: &str,
        request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, RequestError>;
    /// Sends events directly to devices.
    async fn send_to_device(
        &self,
        access_token: &str,
        request: &ToDeviceRequest,
    ) -> Result<(), RequestError>;
    /// Sends a room event.
    async fn send_message(
        &self,
        access_token: &str,
        request: &RoomSendRequest,
    ) -> Result<RoomSendResponse, RequestError>;
    /// Fetches older room events.
    async fn room_messages(
        &self,
        access_token: &str,
        request: &MessagesRequest,
    ) -> Result<MessagesResponse, RequestError>;
    /// Downloads a media or its thumbnail.
    async fn download_media(
        &self,
        access_token: &str,
        request: &MediaRequest,
    ) -> Result<MediaResponse, RequestError>;
    /// Joins a room by id or alias.
    async fn join_room(
        &self,
        access_token: &str,
        request: &JoinRequest,
    ) -> Result<JoinResponse, RequestError>;
    /// Fetches the global display name and avatar of a user.
    async fn get_profile(
        &self,
        access_token: &str,
        request: &ProfileRequest,
    ) -> Result<ProfileResponse, RequestError>;
}

/// `reqwest` implementation of [`Homeserver`].
///
/// # Examples
///
/// ```ignore
/// let homeserver = HomeserverClient::new("matrix.org", Duration::from_secs(30))?;
/// let response = homeserver.login(&request).await?;
/// println!("logged in as {}", response.user_id);
/// ```
pub struct HomeserverClient {
    /// Base URL of the homeserver, the API prefix is appended to it.
    base_url: Url,
    /// HTTP client
    client: Client,
    /// Client side margin added to the sync long-poll timeout
    sync_margin: Duration,
}

impl HomeserverClient {
    /// Create a new [`HomeserverClient`].
    ///
    /// A homeserver given without scheme is reached over `https`.
    ///
    /// # Arguments
    ///
    /// * `homeserver` - URL or server name of the homeserver.
    /// * `request_timeout` - Timeout of every request but the sync long-poll.
    pub fn new(homeserver: &str, request_timeout: Duration) -> Result<Self, RequestError> {
        let homeserver = homeserver.trim();
        let with_scheme = if homeserver.starts_with("http://") || homeserver.starts_with("https://")
        {
            homeserver.to_owned()
        } else {
            format!("https://{}", homeserver)
        };
        let base_url =
            Url::parse(&with_scheme).map_err(|e| RequestError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(RequestError::InvalidUrl(with_scheme));
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("omomatrix/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HomeserverClient {
            base_url,
            client,
            sync_margin: DEFAULT_SYNC_MARGIN,
        })
    }

    /// Overrides the margin added to the sync long-poll timeout.
    pub fn with_sync_margin(mut self, margin: Duration) -> Self {
        self.sync_margin = margin;
        self
    }

    /// Base URL of the homeserver.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds an endpoint URL, each segment is percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RequestError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RequestError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn client_endpoint(&self, segments: &[&str]) -> Result<Url, RequestError> {
        let mut all = vec!["_matrix", "client", "v3"];
        all.extend_from_slice(segments);
        self.endpoint(&all)
    }

    /// Turns a non-success status into a [`RequestError`].
    async fn check(response: Response) -> Result<Response, RequestError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: ErrorResponse = response.json().await.unwrap_or_default();
        debug!("homeserver answered {} {}: {}", status, body.errcode, body.error);

        if status == StatusCode::UNAUTHORIZED
            && (body.errcode == "M_UNKNOWN_TOKEN" || body.errcode == "M_MISSING_TOKEN")
        {
            return Err(RequestError::UnknownToken {
                soft_logout: body.soft_logout,
            });
        }

        Err(RequestError::Api {
            status: status.as_u16(),
            errcode: body.errcode,
            message: body.error,
        })
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, RequestError> {
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Homeserver for HomeserverClient {
    /// Request `POST /login` with the password flow.
    ///
    /// The username is sent as a user identifier, so both a localpart and a
    /// full Matrix id are accepted by the homeserver.
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, RequestError> {
        let url = self.client_endpoint(&["login"])?;
        info!("log in {} on {}", request.username, self.base_url);

        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": request.username },
            "password": request.password,
            "initial_device_display_name": request.device_display_name,
            "refresh_token": true,
        });
        let response = self.client.post(url).json(&body).send().await?;
        let login: LoginResponse = Self::parse(response).await?;

        debug!("login response -> {:?}", &login);
        Ok(login)
    }

    async fn logout(&self, access_token: &str) -> Result<(), RequestError> {
        let url = self.client_endpoint(&["logout"])?;
        info!("log out from {}", self.base_url);

        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&json!({}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, RequestError> {
        let url = self.client_endpoint(&["refresh"])?;
        info!("refresh access token");

        let response = self
            .client
            .post(url)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Request `GET /sync`.
    ///
    /// The HTTP timeout is the long-poll timeout plus the sync margin so an
    /// idle long-poll is never mistaken for a dead connection.
    async fn sync(&self, access_token: &str, request: &SyncRequest) -> Result<Value, RequestError> {
        let url = self.client_endpoint(&["sync"])?;
        debug!("sync since {:?}", request.since);

        let mut query = vec![("timeout", request.timeout_ms.to_string())];
        if let Some(since) = &request.since {
            query.push(("since", since.clone()));
        }
        if request.full_state {
            query.push(("full_state", "true".to_owned()));
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .query(&query)
            .timeout(Duration::from_millis(request.timeout_ms) + self.sync_margin)
            .send()
            .await?;
        let value: Value = Self::parse(response).await?;

        trace!("sync response -> {}", value);
        Ok(value)
    }

    async fn upload_keys(
        &self,
        access_token: &str,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, RequestError> {
        let url = self.client_endpoint(&["keys", "upload"])?;
        info!(
            "upload keys, device keys={}, one-time keys={}, fallback keys={}",
            request.device_keys.is_some(),
            request.one_time_keys.len(),
            request.fallback_keys.len()
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(request)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn query_keys(
        &self,
        access_token: &str,
        request: &KeysQueryRequest,
    ) -> Result<KeysQueryResponse, RequestError> {
        let url = self.client_endpoint(&["keys", "query"])?;
        info!("query device keys of {} users", request.users.len());

        let device_keys: serde_json::Map<String, Value> = request
            .users
            .iter()
            .map(|user| (user.to_string(), json!([])))
            .collect();
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&json!({ "device_keys": device_keys }))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn claim_keys(
        &self,
        access_token: &str,
        request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, RequestError> {
        let url = self.client_endpoint(&["keys", "claim"])?;
        debug!("claim one-time keys for {} users", request.devices.len());

        let one_time_keys: serde_json::Map<String, Value> = request
            .devices
            .iter()
            .map(|(user, devices)| {
                let devices: serde_json::Map<String, Value> = devices
                    .iter()
                    .map(|device| (device.to_string(), json!(SIGNED_CURVE25519)))
                    .collect();
                (user.to_string(), Value::Object(devices))
            })
            .collect();
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&json!({ "one_time_keys": one_time_keys }))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn send_to_device(
        &self,
        access_token: &str,
        request: &ToDeviceRequest,
    ) -> Result<(), RequestError> {
        let url = self.client_endpoint(&["sendToDevice", &request.event_type, &request.txn_id])?;
        debug!(
            "send {} to devices of {} users",
            request.event_type,
            request.messages.len()
        );

        let response = self
            .client
            .put(url)
            .bearer_auth(access_token)
            .json(&json!({ "messages": request.messages }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        access_token: &str,
        request: &RoomSendRequest,
    ) -> Result<RoomSendResponse, RequestError> {
        let url = self.client_endpoint(&[
            "rooms",
            request.room_id.as_str(),
            "send",
            &request.event_type,
            &request.txn_id,
        ])?;
        info!("send {} to {}", request.event_type, request.room_id);

        let response = self
            .client
            .put(url)
            .bearer_auth(access_token)
            .json(&request.content)
            .send()
            .await?;
        let sent: RoomSendResponse = Self::parse(response).await?;

        debug!("sent {} as {}", request.txn_id, sent.event_id);
        Ok(sent)
    }

    async fn room_messages(
        &self,
        access_token: &str,
        request: &MessagesRequest,
    ) -> Result<MessagesResponse, RequestError> {
        let url = self.client_endpoint(&["rooms", request.room_id.as_str(), "messages"])?;
        debug!("fetch {} messages of {} from {}", request.limit, request.room_id, request.from);

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .query(&[
                ("from", request.from.as_str()),
                ("dir", "b"),
                ("limit", &request.limit.to_string()),
            ])
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Request the authenticated media endpoints.
    ///
    /// Thumbnails are cropped squares of the requested edge.
    async fn download_media(
        &self,
        access_token: &str,
        request: &MediaRequest,
    ) -> Result<MediaResponse, RequestError> {
        let kind = if request.thumbnail.is_some() {
            "thumbnail"
        } else {
            "download"
        };
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v1",
            "media",
            kind,
            &request.server_name,
            &request.media_id,
        ])?;
        debug!("download {} of mxc://{}/{}", kind, request.server_name, request.media_id);

        let mut builder = self.client.get(url).bearer_auth(access_token);
        if let Some(size) = request.thumbnail {
            let size = size.to_string();
            builder = builder.query(&[
                ("width", size.as_str()),
                ("height", size.as_str()),
                ("method", "crop"),
            ]);
        }

        let response = Self::check(builder.send().await?).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let bytes = response.bytes().await?.to_vec();

        Ok(MediaResponse {
            content_type,
            bytes,
        })
    }

    async fn join_room(
        &self,
        access_token: &str,
        request: &JoinRequest,
    ) -> Result<JoinResponse, RequestError> {
        let url = self.client_endpoint(&["join", &request.room])?;
        info!("join {}", request.room);

        let query: Vec<(&str, &str)> = request
            .via
            .iter()
            .map(|server| ("via", server.as_str()))
            .collect();
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .query(&query)
            .json(&json!({}))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn get_profile(
        &self,
        access_token: &str,
        request: &ProfileRequest,
    ) -> Result<ProfileResponse, RequestError> {
        let url = self.client_endpoint(&["profile", request.user_id.as_str()])?;
        debug!("fetch profile of {}", request.user_id);

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::parse(response).await
    }
}

/// Extra time given to a sync request on top of its long-poll timeout.
pub const DEFAULT_SYNC_MARGIN: Duration = Duration::from_secs(10);

/// Algorithm of the one-time keys published by this engine.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";
