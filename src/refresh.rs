//! Background refresh loop
//!
//! Drives the scheduler from a single tokio task and forwards what happens to the
//! presentation layer over a channel. Manual refreshes go straight to the shared
//! scheduler, which keeps them from overlapping with timer-driven ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::scheduler::{CodeChanged, RefreshOutcome, Scheduler};

/// Messages sent from the background loop to the host
#[derive(Debug, Clone)]
pub enum RefreshMessage {
    /// A timer-driven refresh finished successfully
    RefreshCompleted(RefreshOutcome),
    /// A timer-driven refresh failed; the loop keeps running
    RefreshError(String),
    /// The current code changed
    CodeChanged(CodeChanged),
}

/// Configuration for the background loop
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// How often the scheduler is asked whether a refresh is due
    pub tick_interval: Duration,
    /// Whether timer-driven refresh is enabled
    pub enabled: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            enabled: true,
        }
    }
}

/// Handle for controlling the background refresh loop
pub struct RefreshHandle {
    /// Channel for receiving refresh messages
    pub receiver: mpsc::Receiver<RefreshMessage>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Spawns the background loop
    ///
    /// With refresh disabled the loop only forwards code change events caused by
    /// manual refreshes. Cancelling `shutdown` stops the loop; pass the same token
    /// to [`Scheduler::with_cancellation`] so an in-flight fetch is abandoned too.
    pub fn spawn(
        scheduler: Arc<Scheduler>,
        config: RefreshConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        // Subscribe before spawning so no change event can slip past.
        let changes = scheduler.subscribe();
        let task = tokio::spawn(run_loop(
            scheduler.clone(),
            changes,
            config,
            shutdown.clone(),
            msg_tx,
        ));

        Self {
            receiver: msg_rx,
            scheduler,
            shutdown,
            task,
        }
    }

    /// Runs a refresh now, joining one already in flight
    pub async fn request_refresh(&self) -> RefreshOutcome {
        self.scheduler.refresh_now().await
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Stops the loop and waits for it to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "refresh loop ended abnormally");
        }
    }
}

async fn run_loop(
    scheduler: Arc<Scheduler>,
    mut changes: broadcast::Receiver<CodeChanged>,
    config: RefreshConfig,
    shutdown: CancellationToken,
    tx: mpsc::Sender<RefreshMessage>,
) {
    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = changes.recv() => match event {
                Ok(event) => {
                    let _ = tx.send(RefreshMessage::CodeChanged(event)).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "dropped stale code change events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick(), if config.enabled => {
                let Some(outcome) = scheduler.on_tick(scheduler.now()).await else {
                    continue;
                };
                let message = match &outcome.error {
                    Some(error) => RefreshMessage::RefreshError(error.to_string()),
                    None => RefreshMessage::RefreshCompleted(outcome),
                };
                let _ = tx.send(message).await;
            }
        }
    }
    debug!("refresh loop stopped");
}

/// Checks for pending refresh messages without blocking
///
/// # Returns
/// * `Some(RefreshMessage)` if a message was available
/// * `None` if no messages are pending
pub fn try_recv(handle: &mut RefreshHandle) -> Option<RefreshMessage> {
    handle.receiver.try_recv().ok()
}
