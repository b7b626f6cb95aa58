//! Poll scheduler
//!
//! Runs the mailbox poller on a fixed interval until shutdown. Each cycle
//! runs on the blocking pool and is awaited before the next tick, so polls
//! never overlap; ticks missed during a slow cycle are skipped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::NotificationEngine;
use crate::mailbox::MailboxPoller;

pub struct PollScheduler {
    poller: Arc<MailboxPoller>,
    engine: Arc<Mutex<NotificationEngine>>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl PollScheduler {
    pub fn new(
        poller: Arc<MailboxPoller>,
        engine: Arc<Mutex<NotificationEngine>>,
        period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            poller,
            engine,
            period,
            shutdown,
        }
    }

    /// Poll until the shutdown signal flips to `true` (or its sender drops).
    /// Returns the number of completed cycles.
    pub async fn run(&mut self) -> usize {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = 0;

        info!(period_secs = self.period.as_secs_f64(), "Starting mailbox poller");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                    cycles += 1;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("Poller received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!(cycles, "Mailbox poller stopped");
        cycles
    }

    /// One cycle. Errors end the cycle only; the next tick retries.
    pub async fn poll_once(&self) {
        let poller = Arc::clone(&self.poller);
        let engine = Arc::clone(&self.engine);

        match tokio::task::spawn_blocking(move || poller.poll(&engine)).await {
            Ok(Ok(sent)) => debug!(sent, "Poll cycle finished"),
            Ok(Err(e)) => error!(error = %e, "Poll cycle failed"),
            Err(e) => error!(error = %e, "Poll task panicked"),
        }
    }
}
