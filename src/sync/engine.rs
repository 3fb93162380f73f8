//! The long-poll sync loop.

use log::{debug, error, info, warn};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::EngineError,
    matrix::{MatrixClient, structs::SyncRequest},
    sync::{Backoff, SyncDelta, SyncSettings},
};

/// Connection state reported by the sync loop.
#[derive(Debug)]
pub enum SyncStatus {
    /// A sync request succeeded.
    Connected,
    /// Requests fail and the loop is waiting before the next attempt.
    Reconnecting { attempt: u32, error: String },
    /// The loop ended because of an error it cannot recover from.
    Failed(EngineError),
}

/// A delta waiting for its consumer.
///
/// The cursor of the delta is persisted once `ack` receives `Ok`. An `Err`
/// stops the loop with that error.
#[derive(Debug)]
pub struct PendingDelta {
    pub delta: SyncDelta,
    pub ack: oneshot::Sender<Result<(), EngineError>>,
}

impl PendingDelta {
    /// Reports the outcome of applying the delta.
    pub fn acknowledge(self, result: Result<(), EngineError>) {
        if self.ack.send(result).is_err() {
            debug!("sync loop is gone, acknowledgement of {} dropped", self.delta.cursor);
        }
    }
}

/// Deltas in the order of the server responses.
pub type DeltaStream = mpsc::Receiver<PendingDelta>;

/// Control over a running sync loop.
pub struct SyncHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Cancels the in-flight request and waits for the loop to end.
    ///
    /// The persisted cursor stays at the last acknowledged delta.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("sync loop panicked: {}", e);
        }
        info!("sync stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Outcome of a single sync request.
enum Step {
    Delta(SyncDelta),
    /// The response was unreadable but carried a cursor to skip to.
    Skip(String),
    Retry(EngineError),
    Fatal(EngineError),
}

/// Sync engine.
///
/// # Examples
///
/// ```ignore
/// let (status_tx, mut status) = mpsc::unbounded_channel();
/// let (handle, mut deltas) = SyncEngine::new(client, config.sync_settings()).start(status_tx);
/// ```
pub struct SyncEngine {
    client: MatrixClient,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(client: MatrixClient, settings: SyncSettings) -> Self {
        SyncEngine { client, settings }
    }

    /// Spawns the sync loop.
    ///
    /// The loop resumes from the cursor of the stored session and runs until
    /// [`SyncHandle::stop`] is called, the [`DeltaStream`] is dropped or a
    /// fatal error is reported on `status`.
    ///
    /// # Arguments
    ///
    /// * `status` - Receives the connection state changes.
    pub fn start(self, status: mpsc::UnboundedSender<SyncStatus>) -> (SyncHandle, DeltaStream) {
        let token = CancellationToken::new();
        let (deltas_tx, deltas_rx) = mpsc::channel(1);

        let task = tokio::spawn(self.run(token.clone(), deltas_tx, status));
        (SyncHandle { token, task }, deltas_rx)
    }

    async fn run(
        self,
        token: CancellationToken,
        deltas: mpsc::Sender<PendingDelta>,
        status: mpsc::UnboundedSender<SyncStatus>,
    ) {
        let mut cursor = self
            .client
            .credentials()
            .session()
            .await
            .and_then(|session| session.sync_token);
        info!("start syncing from {:?}", cursor);

        let mut backoff = Backoff::new(self.settings.backoff);
        let mut connected = false;

        loop {
            let step = tokio::select! {
                _ = token.cancelled() => return,
                step = self.sync_once(cursor.clone()) => step,
            };

            let delta = match step {
                Step::Delta(delta) => delta,
                Step::Skip(next_batch) => {
                    warn!("skip unreadable sync response, continue from {}", next_batch);
                    if let Err(e) = self.client.credentials().persist_sync_token(&next_batch).await {
                        error!("failed to persist sync token: {}", e);
                        status.send(SyncStatus::Failed(e.into())).ok();
                        return;
                    }
                    cursor = Some(next_batch);
                    continue;
                }
                Step::Retry(e) => {
                    connected = false;
                    let Some(delay) = backoff.next_delay() else {
                        error!("giving up after {:?} of failures: {}", backoff.elapsed(), e);
                        status
                            .send(SyncStatus::Failed(EngineError::ConnectivityLost(backoff.elapsed())))
                            .ok();
                        return;
                    };
                    warn!(
                        "sync failed (attempt {}): {}, retrying in {:?}",
                        backoff.attempt(),
                        e,
                        delay
                    );
                    status
                        .send(SyncStatus::Reconnecting {
                            attempt: backoff.attempt(),
                            error: e.to_string(),
                        })
                        .ok();
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = sleep(delay) => continue,
                    }
                }
                Step::Fatal(e) => {
                    error!("sync stopped: {}", e);
                    status.send(SyncStatus::Failed(e)).ok();
                    return;
                }
            };

            backoff.reset();
            if !connected {
                connected = true;
                status.send(SyncStatus::Connected).ok();
            }

            let next_cursor = delta.cursor.clone();
            let (ack_tx, ack_rx) = oneshot::channel();
            let pending = PendingDelta { delta, ack: ack_tx };
            tokio::select! {
                _ = token.cancelled() => return,
                sent = deltas.send(pending) => if sent.is_err() {
                    debug!("delta consumer is gone");
                    return;
                },
            }

            let ack = tokio::select! {
                biased;
                ack = ack_rx => ack,
                _ = token.cancelled() => return,
            };
            match ack {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("delta {} was not applied: {}", next_cursor, e);
                    status.send(SyncStatus::Failed(e)).ok();
                    return;
                }
                Err(_) => {
                    debug!("delta {} dropped without acknowledgement", next_cursor);
                    return;
                }
            }

            if let Err(e) = self.client.credentials().persist_sync_token(&next_cursor).await {
                error!("failed to persist sync token: {}", e);
                status.send(SyncStatus::Failed(e.into())).ok();
                return;
            }
            debug!("sync cursor advanced to {}", next_cursor);
            cursor = Some(next_cursor);
        }
    }

    /// One long-poll request, bounded by the server timeout plus the client
    /// margin.
    async fn sync_once(&self, since: Option<String>) -> Step {
        let request = SyncRequest {
            since: since.clone(),
            timeout_ms: self.settings.timeout.as_millis() as u64,
            full_state: false,
        };
        let limit = self.settings.timeout + self.settings.client_margin;

        let raw = match timeout(limit, self.client.sync(&request)).await {
            Err(_) => {
                return Step::Retry(EngineError::Transport(format!(
                    "no sync response after {:?}",
                    limit
                )));
            }
            Ok(Err(e)) if e.is_retryable() => return Step::Retry(e),
            Ok(Err(e)) => return Step::Fatal(e),
            Ok(Ok(raw)) => raw,
        };

        match SyncDelta::parse(raw, since) {
            Ok(delta) => Step::Delta(delta),
            Err(malformed) => {
                warn!("malformed sync response: {}", malformed.reason);
                match malformed.next_batch {
                    Some(next_batch) => Step::Skip(next_batch),
                    None => Step::Retry(malformed.into()),
                }
            }
        }
    }
}
