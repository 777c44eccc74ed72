//! Background task scheduling.
//!
//! The engine runs a handful of periodic maintenance jobs (segment
//! retention, partition eviction) and a few long-lived workers (the flush
//! pool, the event drains). The scheduler owns all of them and fans a
//! shutdown signal out over a broadcast channel so `shutdown` stops the
//! whole set and waits for them to finish.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A task executed on a fixed interval until shutdown.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute one run of the task
    async fn run(&self) -> Result<()>;
}

pub struct Scheduler {
    handles: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            handles: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// A receiver that fires when shutdown starts. Long-lived workers
    /// spawned through [`Scheduler::spawn`] select on it.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Registers a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.run().await {
                            tracing::error!(task = task.name(), error = %e, "task run failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        });
        self.handles.write().unwrap().push(handle);
        self
    }

    /// Spawns a long-lived worker. The future is expected to finish when
    /// the shutdown receiver it obtained via [`Scheduler::subscribe`]
    /// fires.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = name, error = %e, "worker failed");
            }
        });
        self.handles.write().unwrap().push(handle);
    }

    /// Signals every task and worker to stop and waits for them.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        let handles: Vec<_> = self.handles.write().unwrap().drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
