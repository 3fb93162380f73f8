//! Bounded pool of background jobs.

use std::{future::Future, sync::Arc};

use log::{debug, warn};
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Runs key exchanges, sends, pagination and media fetches with bounded
/// concurrency.
///
/// # Examples
///
/// ```ignore
/// let workers = WorkerPool::new(8);
/// workers.spawn("key upload", async move {
///     if let Err(e) = coordinator.send_outgoing_requests().await {
///         warn!("key upload failed: {}", e);
///     }
/// });
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    token: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool running at most `max_concurrent` jobs at once.
    pub fn new(max_concurrent: usize) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            token: CancellationToken::new(),
        }
    }

    /// Spawns a job. It waits for a free slot and is dropped unfinished if
    /// the pool shuts down first.
    ///
    /// The handle yields `None` for a cancelled job.
    pub fn spawn<F>(&self, name: &'static str, job: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let run = async {
                let _permit = permits.acquire_owned().await.ok()?;
                debug!("run {}", name);
                Some(job.await)
            };
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("{} cancelled", name);
                    None
                }
                output = run => output,
            }
        })
    }

    /// Runs a job in the pool and waits for its result.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotLoggedIn`] if the pool shut down before the job
    /// completed.
    pub async fn run<F, T>(&self, name: &'static str, job: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        match self.spawn(name, job).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(EngineError::NotLoggedIn),
            Err(e) => {
                warn!("{} aborted: {}", name, e);
                Err(EngineError::Transport(format!("{} aborted", name)))
            }
        }
    }

    /// Cancels running and queued jobs. Later jobs are cancelled right away.
    pub fn shutdown(&self) {
        self.token.cancel();
        self.permits.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }
}
