//! Start and stop secure generations as supervised tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::generation::{GenerationService, ServerGeneration};
use crate::ServerError;

/// How a generation ended when asked to stop
#[derive(Debug)]
pub enum StopOutcome {
    /// Finished within the timeout after cancellation
    Drained,
    /// Timeout elapsed; the task was aborted
    Forced,
    /// Had already ended before stop was called
    AlreadyFinished(Result<(), ServerError>),
}

/// Typed handle to a running generation
#[derive(Debug)]
pub struct GenerationHandle {
    id: u64,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
    reported: bool,
}

impl GenerationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.reported || self.task.is_finished()
    }

    /// Resolves when the generation ends on its own (bind failure, crash).
    ///
    /// Cancel safe. Reports the outcome once; later calls never resolve.
    pub async fn completed(&mut self) -> Result<(), ServerError> {
        if self.reported {
            return std::future::pending().await;
        }
        let result = flatten((&mut self.task).await);
        self.reported = true;
        result
    }
}

fn flatten(joined: Result<Result<(), ServerError>, JoinError>) -> Result<(), ServerError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ServerError::Task(e.to_string())),
    }
}

/// Owns the service that runs generations
#[derive(Clone)]
pub struct ServerSupervisor {
    service: Arc<dyn GenerationService>,
}

impl ServerSupervisor {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self { service }
    }

    /// Spawn the generation and return at once; bind errors surface via the handle
    pub fn start(&self, generation: ServerGeneration) -> GenerationHandle {
        let id = generation.id;
        let shutdown = generation.shutdown.clone();
        let service = self.service.clone();

        debug!(generation = id, "Starting generation on {}", generation.bind_addr);
        let task = tokio::spawn(async move { service.serve(generation).await });

        GenerationHandle {
            id,
            shutdown,
            task,
            reported: false,
        }
    }

    /// Cancel, wait up to `timeout`, then abort. Never fails.
    pub async fn stop(&self, handle: GenerationHandle, timeout: Duration) -> StopOutcome {
        let GenerationHandle {
            id,
            shutdown,
            mut task,
            reported,
        } = handle;

        shutdown.cancel();

        if reported {
            debug!(generation = id, "Generation already reported completion");
            return StopOutcome::AlreadyFinished(Ok(()));
        }

        if task.is_finished() {
            let result = flatten((&mut task).await);
            if let Err(e) = &result {
                warn!(generation = id, "Generation had already failed: {}", e);
            }
            return StopOutcome::AlreadyFinished(result);
        }

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => {
                if let Err(e) = flatten(joined) {
                    warn!(generation = id, "Generation reported an error while draining: {}", e);
                }
                info!(generation = id, "Generation drained");
                StopOutcome::Drained
            }
            Err(_) => {
                warn!(
                    generation = id,
                    "Generation did not drain within {:?}, aborting",
                    timeout
                );
                task.abort();
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        debug!(generation = id, "Aborted generation ended with: {}", e);
                    }
                }
                StopOutcome::Forced
            }
        }
    }
}
