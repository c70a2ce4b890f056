use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::{SyncEngine, SyncReport};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    ConnectivityRestored,
    Foreground,
    Periodic,
    /// Opportunistic execution window granted by the host for `budget`.
    BackgroundWindow { budget: Duration },
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::BackgroundWindow { .. } => "background_window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundOutcome {
    Completed(SyncReport),
    Failed(String),
    /// The window closed before the run finished. The request in flight,
    /// if any, is recorded as a failed attempt.
    Expired,
}

impl BackgroundOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BackgroundOutcome::Completed(_))
    }
}

/// Host hook for background execution windows.
pub trait BackgroundRegistrar: Send + Sync {
    /// Requests the next window. Called before the current window does any work.
    fn schedule_next(&self, earliest_in: Duration);

    fn window_finished(&self, _outcome: &BackgroundOutcome) {}
}

/// Registrar for hosts without a background task facility.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRegistrar;

impl BackgroundRegistrar for LoggingRegistrar {
    fn schedule_next(&self, earliest_in: Duration) {
        debug!(earliest_in_secs = earliest_in.as_secs(), "next background window requested");
    }

    fn window_finished(&self, outcome: &BackgroundOutcome) {
        debug!(success = outcome.is_success(), "background window finished");
    }
}

/// Cloneable sender side of a [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SyncTrigger>,
}

impl SchedulerHandle {
    /// Returns false once the scheduler has stopped.
    pub fn notify(&self, trigger: SyncTrigger) -> bool {
        self.tx.send(trigger).is_ok()
    }
}

/// Turns external triggers into `sync_all` runs. The engine's in-flight
/// guard is the only concurrency control.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    registrar: Arc<dyn BackgroundRegistrar>,
    interval: Duration,
    periodic_budget: Option<Duration>,
    tx: mpsc::UnboundedSender<SyncTrigger>,
    rx: mpsc::UnboundedReceiver<SyncTrigger>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            engine,
            registrar: Arc::new(LoggingRegistrar),
            interval: DEFAULT_SYNC_INTERVAL,
            periodic_budget: None,
            tx,
            rx,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs timer ticks as bounded background windows.
    pub fn with_periodic_budget(mut self, budget: Duration) -> Self {
        self.periodic_budget = Some(budget);
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn BackgroundRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn notify(&self, trigger: SyncTrigger) -> bool {
        self.tx.send(trigger).is_ok()
    }

    /// Serves triggers until `shutdown` resolves. The first periodic run
    /// fires one interval after start.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        loop {
            let trigger = tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.periodic_trigger(),
                Some(trigger) = self.rx.recv() => trigger,
            };
            let engine = Arc::clone(&self.engine);
            let registrar = Arc::clone(&self.registrar);
            let interval = self.interval;
            tokio::spawn(async move {
                fire(&engine, registrar.as_ref(), interval, trigger).await;
            });
        }
        info!("scheduler stopped");
    }

    fn periodic_trigger(&self) -> SyncTrigger {
        match self.periodic_budget {
            Some(budget) => SyncTrigger::BackgroundWindow { budget },
            None => SyncTrigger::Periodic,
        }
    }

    /// Runs one trigger to completion on the current task.
    pub async fn fire(&self, trigger: SyncTrigger) -> BackgroundOutcome {
        fire(&self.engine, self.registrar.as_ref(), self.interval, trigger).await
    }
}

async fn fire(
    engine: &SyncEngine,
    registrar: &dyn BackgroundRegistrar,
    interval: Duration,
    trigger: SyncTrigger,
) -> BackgroundOutcome {
    debug!(trigger = trigger.as_str(), "sync triggered");
    let cancel = CancellationToken::new();
    let SyncTrigger::BackgroundWindow { budget } = trigger else {
        return run_sync(engine, trigger, &cancel).await;
    };

    registrar.schedule_next(interval);
    let run = run_sync(engine, trigger, &cancel);
    tokio::pin!(run);
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::time::sleep(budget) => {
            warn!(budget_ms = budget.as_millis() as u64, "background window expired");
            // The engine stops at once and books the abandoned attempt.
            cancel.cancel();
            run.await;
            BackgroundOutcome::Expired
        }
    };
    registrar.window_finished(&outcome);
    outcome
}

async fn run_sync(
    engine: &SyncEngine,
    trigger: SyncTrigger,
    cancel: &CancellationToken,
) -> BackgroundOutcome {
    match engine.sync_until(cancel).await {
        Ok(report) => {
            if !report.skipped {
                debug!(
                    trigger = trigger.as_str(),
                    applied = report.applied,
                    "triggered sync finished"
                );
            }
            BackgroundOutcome::Completed(report)
        }
        Err(err) => {
            warn!(trigger = trigger.as_str(), error = %err, "triggered sync failed");
            BackgroundOutcome::Failed(err.to_string())
        }
    }
}
