//! The task owning the room model.

use std::sync::Arc;

use log::{debug, warn};
use matrix_sdk::ruma::OwnedUserId;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    crypto::EncryptionCoordinator,
    error::EngineError,
    model::{ChangeSet, LocalChange, ModelSnapshot, RoomModel},
    session::{Notification, NotificationHub, WorkerPool},
    store::RoomStore,
    sync::{DeltaStream, PendingDelta, SyncDelta},
};

/// A local change waiting for the applier.
pub(crate) struct LocalCommand {
    pub(crate) change: LocalChange,
    pub(crate) reply: Option<oneshot::Sender<Result<ChangeSet, EngineError>>>,
}

/// Sends local changes to a running applier.
#[derive(Clone)]
pub(crate) struct LocalChanges {
    tx: mpsc::UnboundedSender<LocalCommand>,
}

impl LocalChanges {
    /// Queues a change without waiting for it.
    pub(crate) fn push(&self, change: LocalChange) {
        let command = LocalCommand {
            change,
            reply: None,
        };
        if self.tx.send(command).is_err() {
            debug!("applier stopped, local change dropped");
        }
    }

    /// Applies a change and waits for the result.
    pub(crate) async fn apply(&self, change: LocalChange) -> Result<ChangeSet, EngineError> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(LocalCommand {
                change,
                reply: Some(reply),
            })
            .map_err(|_| EngineError::NotLoggedIn)?;
        result.await.map_err(|_| EngineError::NotLoggedIn)?
    }
}

/// Applies sync deltas and local changes in arrival order.
///
/// A delta is decrypted, merged and persisted before it is acknowledged, so
/// the sync cursor never moves past a delta the model does not hold.
pub(crate) struct Applier {
    pub(crate) user_id: OwnedUserId,
    pub(crate) model: RoomModel,
    pub(crate) rooms: Arc<RoomStore>,
    pub(crate) coordinator: Arc<EncryptionCoordinator>,
    pub(crate) workers: WorkerPool,
    pub(crate) snapshots: watch::Sender<Arc<ModelSnapshot>>,
    pub(crate) feed: NotificationHub,
}

impl Applier {
    /// Starts the applier. It stops when the delta stream ends.
    pub(crate) fn spawn(self, deltas: DeltaStream) -> (LocalChanges, JoinHandle<()>) {
        let (tx, commands) = mpsc::unbounded_channel();
        self.snapshots.send_replace(Arc::new(self.model.snapshot()));
        let task = tokio::spawn(self.run(deltas, commands));
        (LocalChanges { tx }, task)
    }

    async fn run(
        mut self,
        mut deltas: DeltaStream,
        mut commands: mpsc::UnboundedReceiver<LocalCommand>,
    ) {
        loop {
            tokio::select! {
                pending = deltas.recv() => match pending {
                    Some(pending) => self.apply_pending(pending).await,
                    None => break,
                },
                Some(command) = commands.recv() => self.apply_command(command).await,
            }
        }
        debug!("applier stopped");
    }

    async fn apply_pending(&mut self, mut pending: PendingDelta) {
        let result = self.apply_delta(&mut pending.delta).await;
        if result.is_ok() {
            let coordinator = self.coordinator.clone();
            self.workers.spawn("key maintenance", async move {
                if let Err(e) = coordinator.after_sync().await {
                    warn!("key maintenance failed: {}", e);
                }
            });
        }
        pending.acknowledge(result);
    }

    /// Merges a delta into a copy of the model and makes it current once the
    /// changed rooms are persisted.
    async fn apply_delta(&mut self, delta: &mut SyncDelta) -> Result<(), EngineError> {
        self.coordinator.prepare_delta(delta).await?;
        let mut next = self.model.clone();
        let changes = next.apply_delta(delta);
        if changes.is_empty() && changes.spaces.is_empty() {
            return Ok(());
        }

        self.rooms.save(&self.user_id, &next, &changes.rooms).await?;
        self.model = next;
        self.publish(&changes);
        Ok(())
    }

    /// Applies a local change the same way: a change that cannot be
    /// persisted is not applied and its caller gets the error.
    async fn apply_command(&mut self, command: LocalCommand) {
        let mut next = self.model.clone();
        let result = match next.apply_local(command.change) {
            Ok(changes) => match self.rooms.save(&self.user_id, &next, &changes.rooms).await {
                Ok(()) => {
                    self.model = next;
                    self.publish(&changes);
                    Ok(changes)
                }
                Err(e) => {
                    warn!("failed to persist local change: {}", e);
                    Err(e.into())
                }
            },
            Err(e) => Err(e),
        };
        if let Some(reply) = command.reply {
            // The caller may have given up waiting.
            let _ = reply.send(result);
        }
    }

    fn publish(&self, changes: &ChangeSet) {
        self.snapshots.send_replace(Arc::new(self.model.snapshot()));
        self.feed.publish_all(Notification::from_changes(changes));
    }
}
