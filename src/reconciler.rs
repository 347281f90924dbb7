//! Route reconciliation
//!
//! A single task owns every write to the route table. Triggers from startup,
//! the periodic sweep and runtime events are queued on a channel; triggers that
//! arrive within the coalescing window collapse into one pass, and triggers
//! that arrive during a pass produce at most one follow-up pass.

use crate::config::Config;
use crate::error::DiscoveryError;
use crate::reload::ReloadCoordinator;
use crate::render::{render, RenderOptions};
use crate::routes::{build_candidates, diff, RouteDiff, RouteSnapshot, RouteTable};
use crate::runtime::ContainerRuntime;
use crate::shutdown::wait_for_shutdown;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Triggers buffered before further ones are dropped (they would collapse anyway)
const TRIGGER_BUFFER: usize = 64;

/// Why a reconciliation pass or reload happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Startup,
    Periodic,
    Event,
    /// Operator request (SIGHUP)
    Signal,
    /// Re-applying a generation whose previous reload was rejected
    Retry,
}

/// Cloneable handle for requesting a reconciliation pass
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: mpsc::Sender<TriggerSource>,
}

impl Trigger {
    pub fn fire(&self, source: TriggerSource) {
        match self.tx.try_send(source) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(?source, "Trigger queue full, pass already pending");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(?source, "Reconciler stopped, trigger ignored");
            }
        }
    }
}

pub fn trigger_channel() -> (Trigger, mpsc::Receiver<TriggerSource>) {
    let (tx, rx) = mpsc::channel(TRIGGER_BUFFER);
    (Trigger { tx }, rx)
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Discovery failed; routes untouched
    DiscoveryFailed,
    /// Discovered state matches the table; nothing written
    Unchanged,
    /// Table moved on while the pass ran; candidate discarded
    Stale,
    /// Generation committed (or re-applied) and handed to the reload coordinator
    Applied {
        generation: u64,
        changes: RouteDiff,
        /// Whether the engine was reloaded
        reloaded: bool,
    },
    /// Generation committed but its configuration was rejected
    ReloadFailed { generation: u64 },
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    routes: Arc<RouteTable>,
    coordinator: Arc<ReloadCoordinator>,
    network: String,
    discovery_timeout: Duration,
    coalesce_window: Duration,
    render_options: RenderOptions,
    /// The current generation has not been applied yet
    reload_pending: bool,
    /// The last apply of the current generation was rejected
    reload_failed: bool,
}

impl Reconciler {
    pub fn new(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        routes: Arc<RouteTable>,
        coordinator: Arc<ReloadCoordinator>,
        render_options: RenderOptions,
    ) -> Self {
        Self {
            runtime,
            routes,
            coordinator,
            network: config.server.network.clone(),
            discovery_timeout: config.discovery.timeout(),
            coalesce_window: config.discovery.coalesce_window(),
            render_options,
            // The first pass always writes its own configuration, even with no routes
            reload_pending: true,
            reload_failed: false,
        }
    }

    /// Process triggers until shutdown or until every trigger handle is dropped
    pub async fn run(
        mut self,
        mut triggers: mpsc::Receiver<TriggerSource>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            network = %self.network,
            coalesce_window_ms = self.coalesce_window.as_millis() as u64,
            "Reconciler started"
        );

        loop {
            let source = tokio::select! {
                trigger = triggers.recv() => match trigger {
                    Some(source) => source,
                    None => break,
                },
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            let window = tokio::time::sleep(self.coalesce_window);
            tokio::pin!(window);
            let mut collapsed = 0u32;
            loop {
                tokio::select! {
                    _ = &mut window => break,
                    Some(_) = triggers.recv() => collapsed += 1,
                    _ = wait_for_shutdown(&mut shutdown_rx) => {
                        info!("Reconciler shutting down");
                        return;
                    }
                }
            }
            if collapsed > 0 {
                debug!(?source, collapsed, "Coalesced reconciliation triggers");
            }

            self.run_pass(source).await;
        }

        info!("Reconciler shutting down");
    }

    /// Run one pass: discover, diff, commit, render, reload
    pub async fn run_pass(&mut self, source: TriggerSource) -> PassOutcome {
        let base = self.routes.snapshot();

        let listing = tokio::time::timeout(
            self.discovery_timeout,
            self.runtime.list_labeled_containers(&self.network),
        )
        .await
        .unwrap_or(Err(DiscoveryError::Timeout(self.discovery_timeout)));

        let records = match listing {
            Ok(records) => records,
            Err(e) => {
                warn!(?source, error = %e, "Discovery unavailable, keeping current routes");
                return PassOutcome::DiscoveryFailed;
            }
        };

        let candidates = build_candidates(&records, &base, Utc::now());
        let changes = diff(&base, &candidates);

        if changes.is_empty() {
            if self.reload_pending {
                if !self.reload_failed {
                    return self.reload(base, changes, source).await;
                }
                info!(generation = base.generation(), "Retrying previously rejected configuration");
                return self.reload(base, changes, TriggerSource::Retry).await;
            }
            debug!(?source, generation = base.generation(), routes = base.len(), "Routes unchanged");
            return PassOutcome::Unchanged;
        }

        let snapshot = match self.routes.commit(base.generation(), candidates) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Discarding reconciliation result");
                return PassOutcome::Stale;
            }
        };

        info!(
            ?source,
            generation = snapshot.generation(),
            added = ?changes.added,
            changed = ?changes.changed,
            removed = ?changes.removed,
            "Routes updated"
        );

        self.reload_pending = true;
        self.reload_failed = false;
        self.reload(snapshot, changes, source).await
    }

    async fn reload(
        &mut self,
        snapshot: Arc<RouteSnapshot>,
        changes: RouteDiff,
        source: TriggerSource,
    ) -> PassOutcome {
        let generation = snapshot.generation();
        let text = render(&snapshot, &self.render_options);

        match self.coordinator.apply(text, generation, source).await {
            Ok(reloaded) => {
                self.reload_pending = false;
                self.reload_failed = false;
                PassOutcome::Applied {
                    generation,
                    changes,
                    reloaded,
                }
            }
            Err(e) => {
                self.reload_failed = true;
                warn!(generation, error = %e, "Reload failed, will retry on next trigger");
                PassOutcome::ReloadFailed { generation }
            }
        }
    }
}

/// Fire a periodic trigger until shutdown
pub async fn periodic_sweep(
    trigger: Trigger,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => trigger.fire(TriggerSource::Periodic),
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                debug!("Periodic sweep stopped");
                break;
            }
        }
    }
}
