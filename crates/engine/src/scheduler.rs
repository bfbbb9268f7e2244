//! Background dispatch of queued messages.
//!
//! The scheduler listens to [`EngineEvent::MessageReadyToProcess`] and runs
//! each dispatch on the blocking pool, at most `worker_threads` at a time.
//! When it falls behind the event channel it rescans the queue instead.
//! Orphan messages are purged before the first scan.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchOutcome, EngineEvent};
use crate::engine::Engine;
use crate::store::ReceivedMessageId;

/// A running scheduler task.
pub struct Scheduler {
    shutdown_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawns the scheduler on the current tokio runtime.
    ///
    /// Messages already queued are dispatched first.
    pub fn spawn(engine: Engine) -> Self {
        let events = engine.subscribe();
        let shutdown_token = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(engine.worker_threads()));
        let task = tokio::spawn(run(engine, events, semaphore, shutdown_token.clone()));
        Self {
            shutdown_token,
            task,
        }
    }

    /// Token cancelling the scheduler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Stops accepting events and waits for the scheduler task to end.
    ///
    /// Dispatches already running finish on the blocking pool.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "Scheduler task ended abnormally");
        }
    }
}

async fn run(
    engine: Engine,
    mut events: broadcast::Receiver<EngineEvent>,
    semaphore: Arc<Semaphore>,
    shutdown_token: CancellationToken,
) {
    info!(workers = engine.worker_threads(), "Scheduler started");
    purge_orphans(&engine).await;
    rescan(&engine, &semaphore).await;

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                info!("Scheduler received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Ok(EngineEvent::MessageReadyToProcess(id)) => schedule(&engine, &semaphore, id).await,
                Ok(EngineEvent::InstanceFinished { key, state }) => {
                    debug!(instance_uid = %key.instance_uid, state, "Protocol instance finished");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Scheduler lagged behind events, rescanning queue");
                    rescan(&engine, &semaphore).await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn purge_orphans(engine: &Engine) {
    let purger = engine.clone();
    match tokio::task::spawn_blocking(move || purger.purge_orphan_messages()).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(%err, "Could not purge orphan messages"),
        Err(err) => warn!(%err, "Orphan purge task failed"),
    }
}

async fn rescan(engine: &Engine, semaphore: &Arc<Semaphore>) {
    let lookup = engine.clone();
    let ids = match tokio::task::spawn_blocking(move || lookup.pending_ids()).await {
        Ok(Ok(ids)) => ids,
        Ok(Err(err)) => {
            warn!(%err, "Could not list queued messages");
            return;
        }
        Err(err) => {
            warn!(%err, "Queue scan task failed");
            return;
        }
    };
    for id in ids {
        schedule(engine, semaphore, id).await;
    }
}

async fn schedule(engine: &Engine, semaphore: &Arc<Semaphore>, id: ReceivedMessageId) {
    let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
        return;
    };
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        match engine.process(id) {
            Ok(DispatchOutcome::Held) => debug!(message_id = %id, "Message held"),
            Ok(outcome) => debug!(message_id = %id, ?outcome, "Message dispatched"),
            Err(err) => warn!(message_id = %id, %err, "Dispatch failed"),
        }
    });
}
