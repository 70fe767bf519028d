//! Running a pipeline.
//!
//! An [`Execution`] owns one [`Worker`] per stage. Starting it spawns every
//! worker on the runtime; stopping it broadcasts a shutdown signal, waits for
//! each worker to acknowledge, then releases the flows. Stage failures are
//! funnelled through a single error channel and surface as events on the
//! execution's [`PubSub`].

mod codec;
mod invoker;
mod worker;

pub use codec::RawCodec;
pub use invoker::{Dialer, GrpcDialer, GrpcInvoker, Invoker};
pub use worker::{Worker, WorkerState};

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::pubsub::{PubSub, PubSubConfig, Subscription};

/// Execution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Capacity of each link's queue.
    pub queue_capacity: usize,
    /// Deadline of a single stage invocation.
    pub invocation_timeout_ms: u64,
    /// Per-stage message limit. 0 is unlimited.
    pub max_messages: u64,
    /// Connection attempts when dialing a stage.
    pub connect_retries: u32,
    /// Minimum spacing of the requests a source stage starts. 0 issues the
    /// next request as soon as the previous reply is in.
    pub source_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            invocation_timeout_ms: 1000,
            max_messages: 0,
            connect_retries: 5,
            source_interval_ms: 0,
        }
    }
}

impl ExecutionConfig {
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn source_interval(&self) -> Duration {
        Duration::from_millis(self.source_interval_ms)
    }
}

struct StageError {
    stage: String,
    error: Error,
}

struct RunningWorker {
    stage: String,
    done: oneshot::Receiver<()>,
    handle: JoinHandle<Worker>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    workers: Vec<RunningWorker>,
    errors: mpsc::Sender<StageError>,
    drain: JoinHandle<()>,
}

enum Lifecycle {
    Created(Vec<Worker>),
    Running(Running),
    Stopped,
}

/// A started (or startable) instance of an orchestration.
pub struct Execution {
    name: String,
    pubsub: Arc<PubSub>,
    lifecycle: Mutex<Lifecycle>,
    failed: Arc<StdMutex<HashSet<String>>>,
}

impl Execution {
    pub fn new(name: impl Into<String>, workers: Vec<Worker>, pubsub: PubSubConfig) -> Self {
        Self {
            name: name.into(),
            pubsub: Arc::new(PubSub::new(pubsub)),
            lifecycle: Mutex::new(Lifecycle::Created(workers)),
            failed: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pubsub(&self) -> &Arc<PubSub> {
        &self.pubsub
    }

    /// Attach an observer to the execution's events.
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.pubsub.subscribe().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running(_))
    }

    /// Stages whose worker reported an error.
    pub fn failed_stages(&self) -> HashSet<String> {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawn every worker. A no-op when already running.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let workers = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Created(workers) => workers,
            Lifecycle::Running(running) => {
                *lifecycle = Lifecycle::Running(running);
                return Ok(());
            }
            Lifecycle::Stopped => {
                return Err(Error::failed_precondition(format!(
                    "execution {} already stopped",
                    self.name
                )));
            }
        };

        let (shutdown, _) = watch::channel(false);
        let (errors, mut error_rx) = mpsc::channel::<StageError>(workers.len().max(1));

        let drain = {
            let pubsub = self.pubsub.clone();
            let failed = self.failed.clone();
            let execution = self.name.clone();
            tokio::spawn(async move {
                while let Some(StageError { stage, error }) = error_rx.recv().await {
                    error!(execution = %execution, stage = %stage, error = %error, "Stage failed");
                    failed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(stage.clone());
                    pubsub.publish(format!("stage {} failed: {}", stage, error)).await;
                }
            })
        };

        self.pubsub
            .publish(format!("execution {} started", self.name))
            .await;

        let mut running = Vec::with_capacity(workers.len());
        for mut worker in workers {
            let stage = worker.stage().to_string();
            let (done_tx, done) = oneshot::channel();
            let shutdown_rx = shutdown.subscribe();
            let errors = errors.clone();
            let pubsub = self.pubsub.clone();

            let handle = tokio::spawn(async move {
                pubsub.publish(format!("stage {} started", worker.stage())).await;
                match worker.run(shutdown_rx).await {
                    Ok(processed) => {
                        pubsub
                            .publish(format!(
                                "stage {} completed after {} messages",
                                worker.stage(),
                                processed
                            ))
                            .await;
                        let _ = done_tx.send(());
                    }
                    Err(error) => {
                        let stage = worker.stage().to_string();
                        let _ = errors.send(StageError { stage, error }).await;
                    }
                }
                worker
            });

            running.push(RunningWorker {
                stage,
                done,
                handle,
            });
        }

        info!(execution = %self.name, workers = running.len(), "Execution started");
        *lifecycle = Lifecycle::Running(Running {
            shutdown,
            workers: running,
            errors,
            drain,
        });
        Ok(())
    }

    /// Signal every worker to stop and wait until all of them have. Flows
    /// are closed and the event stream ends. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(running) => running,
            Lifecycle::Created(workers) => {
                for worker in &workers {
                    worker.close();
                }
                self.pubsub.close().await;
                return Ok(());
            }
            Lifecycle::Stopped => return Ok(()),
        };

        let _ = running.shutdown.send(true);

        let (dones, handles): (Vec<_>, Vec<_>) = running
            .workers
            .into_iter()
            .map(|w| (w.done, (w.stage, w.handle)))
            .unzip();
        // A worker that failed drops its sender without acknowledging.
        join_all(dones).await;

        for (stage, handle) in handles {
            match handle.await {
                Ok(worker) => worker.close(),
                Err(e) => {
                    warn!(execution = %self.name, stage = %stage, error = %e, "Worker task ended abnormally");
                    self.failed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(stage);
                }
            }
        }

        drop(running.errors);
        if let Err(e) = running.drain.await {
            warn!(execution = %self.name, error = %e, "Error drain task ended abnormally");
        }

        self.pubsub
            .publish(format!("execution {} stopped", self.name))
            .await;
        self.pubsub.close().await;
        info!(execution = %self.name, "Execution stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution").field("name", &self.name).finish()
    }
}
