//! Periodic task runner.
//!
//! Collector, publisher and pruner each run in their own tokio task on their
//! own interval. A tick is awaited inline, so a task never overlaps itself,
//! and a slow tick delays the next one instead of triggering a burst
//! (`MissedTickBehavior::Delay`). Every tick is bounded by `tick_timeout`;
//! for the publisher the bound covers drain and delivery, never the commit.
//!
//! The pruner also wakes when the collector raises the urgent prune signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::collector::{CollectOutcome, Collector};
use crate::config::Config;
use crate::publisher::{PublishOutcome, Publisher};
use crate::pruner::Pruner;
use crate::store::ReadingStore;

/// Cadences and bounds for the periodic tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub collect_interval: Duration,
    pub publish_interval: Duration,
    pub prune_interval: Duration,

    /// Upper bound for a single tick of any task
    pub tick_timeout: Duration,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            collect_interval: config.collect_interval,
            publish_interval: config.publish_interval,
            prune_interval: config.prune_interval,
            tick_timeout: config.tick_timeout,
        }
    }
}

/// Owns the three pipeline stages until spawned.
pub struct Scheduler {
    collector: Collector,
    publisher: Publisher,
    pruner: Pruner,
    store: ReadingStore,
    urgent_prune: Arc<Notify>,
    config: SchedulerConfig,
}

/// Handle to running scheduler tasks.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new(
        collector: Collector,
        publisher: Publisher,
        pruner: Pruner,
        store: ReadingStore,
        urgent_prune: Arc<Notify>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            collector,
            publisher,
            pruner,
            store,
            urgent_prune,
            config,
        }
    }

    /// Start all three tasks on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);
        let config = self.config;

        info!(
            collect_interval_secs = config.collect_interval.as_secs_f64(),
            publish_interval_secs = config.publish_interval.as_secs_f64(),
            prune_interval_secs = config.prune_interval.as_secs_f64(),
            "Starting scheduler"
        );

        let collector = tokio::spawn(run_collector(self.collector, config, rx.clone()));
        let publisher = tokio::spawn(run_publisher(
            self.publisher,
            self.store,
            config,
            rx.clone(),
        ));
        let pruner = tokio::spawn(run_pruner(self.pruner, self.urgent_prune, config, rx));

        SchedulerHandle {
            shutdown,
            tasks: vec![
                ("collector", collector),
                ("publisher", publisher),
                ("pruner", pruner),
            ],
        }
    }
}

impl SchedulerHandle {
    /// Ask every task to stop after its current tick.
    pub fn shutdown(&self) {
        // Receivers only vanish once every task has already exited
        let _ = self.shutdown.send(true);
    }

    /// Wait for all tasks, aborting any that outlive `grace`.
    pub async fn join(self, grace: Duration) {
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task panicked"),
                Err(_) => {
                    warn!(task = name, "Task shutdown timed out after {:?}", grace);
                    handle.abort();
                }
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_collector(
    collector: Collector,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(config.collect_interval);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        match tokio::time::timeout(config.tick_timeout, collector.tick()).await {
            Ok(CollectOutcome::Appended(id)) => debug!(id = id, "Collector tick"),
            Ok(outcome) => debug!(outcome = ?outcome, "Collector tick"),
            Err(_) => error!(timeout = ?config.tick_timeout, "Collector tick abandoned"),
        }
    }
    info!("Collector stopped");
}

async fn run_publisher(
    mut publisher: Publisher,
    store: ReadingStore,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(config.publish_interval);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        // The publisher applies the bound itself so a started commit always completes
        match publisher.tick_bounded(config.tick_timeout).await {
            outcome @ (PublishOutcome::Committed { .. } | PublishOutcome::Aborted { .. }) => {
                debug!(outcome = ?outcome, "Publisher tick");
                match store.call(|s| s.count_unsent()).await {
                    Ok(backlog) => info!(unsent = backlog, "Delivery backlog"),
                    Err(e) => warn!(error = %e, "Failed to count unsent readings"),
                }
            }
            PublishOutcome::Abandoned => {
                error!(timeout = ?config.tick_timeout, "Publisher tick abandoned")
            }
            outcome => debug!(outcome = ?outcome, "Publisher tick"),
        }
    }

    let stats = publisher.stats();
    info!(
        cycles = stats.cycles,
        committed = stats.readings_committed,
        aborted = stats.cycles_aborted,
        "Publisher stopped"
    );
}

async fn run_pruner(
    pruner: Pruner,
    urgent_prune: Arc<Notify>,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(config.prune_interval);

    while !*shutdown.borrow() {
        let urgent = tokio::select! {
            _ = ticker.tick() => false,
            _ = urgent_prune.notified() => true,
            _ = shutdown.changed() => break,
        };

        match tokio::time::timeout(config.tick_timeout, pruner.tick(urgent)).await {
            Ok(Ok(outcome)) => debug!(
                deleted = outcome.deleted,
                urgent = outcome.urgent,
                "Pruner tick"
            ),
            Ok(Err(e)) => warn!(error = %e, urgent = urgent, "Prune failed"),
            Err(_) => error!(timeout = ?config.tick_timeout, "Pruner tick abandoned"),
        }
    }
    info!("Pruner stopped");
}
