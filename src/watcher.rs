//! Runtime event subscription
//!
//! Events are only used as a signal: each decoded lifecycle event fires a
//! reconciliation trigger and the reconciler re-reads authoritative state.

use crate::error::EventStreamError;
use crate::reconciler::{Trigger, TriggerSource};
use crate::runtime::{ContainerRuntime, EventStream};
use crate::shutdown::wait_for_shutdown;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Wait before reopening a stream that ended cleanly
pub const CLEAN_END_DELAY: Duration = Duration::from_secs(1);
/// Wait before reopening a stream that failed
pub const FAILURE_DELAY: Duration = Duration::from_secs(5);

/// How a subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Clean,
    Failed,
}

/// Reconnect bookkeeping; there is no retry cap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectState {
    /// Reconnects since the watcher started
    pub attempt: u64,
    pub last_delay: Duration,
}

impl ReconnectState {
    fn schedule(&mut self, end: StreamEnd, clean_delay: Duration, failure_delay: Duration) -> Duration {
        self.attempt += 1;
        self.last_delay = match end {
            StreamEnd::Clean => clean_delay,
            StreamEnd::Failed => failure_delay,
        };
        self.last_delay
    }
}

pub struct EventWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    network: String,
    trigger: Trigger,
    state: ReconnectState,
    clean_delay: Duration,
    failure_delay: Duration,
}

impl EventWatcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, network: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            runtime,
            network: network.into(),
            trigger,
            state: ReconnectState::default(),
            clean_delay: CLEAN_END_DELAY,
            failure_delay: FAILURE_DELAY,
        }
    }

    /// Override reconnect delays
    pub fn with_delays(mut self, clean_delay: Duration, failure_delay: Duration) -> Self {
        self.clean_delay = clean_delay;
        self.failure_delay = failure_delay;
        self
    }

    /// Consume events until shutdown, reopening the subscription whenever it ends
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> ReconnectState {
        info!(network = %self.network, "Watching container events");

        loop {
            let stream = self.runtime.events();
            let end = tokio::select! {
                end = self.consume(stream) => end,
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            let delay = self.state.schedule(end, self.clean_delay, self.failure_delay);
            match end {
                StreamEnd::Clean => {
                    debug!(attempt = self.state.attempt, delay_ms = delay.as_millis() as u64, "Event stream ended, reconnecting");
                }
                StreamEnd::Failed => {
                    warn!(attempt = self.state.attempt, delay_ms = delay.as_millis() as u64, "Event stream failed, reconnecting");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        info!("Event watcher shutting down");
        self.state
    }

    /// Drain one subscription; the stream (and its connection) is dropped on return
    async fn consume(&self, mut stream: EventStream) -> StreamEnd {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    debug!(action = %event.action, container = %event.container_id, "Container event");
                    self.trigger.fire(TriggerSource::Event);
                }
                Err(EventStreamError::Malformed(reason)) => {
                    debug!(reason, "Skipping malformed event");
                }
                Err(e @ EventStreamError::Transport(_)) => {
                    warn!(error = %e, "Event stream error");
                    return StreamEnd::Failed;
                }
            }
        }
        StreamEnd::Clean
    }
}
