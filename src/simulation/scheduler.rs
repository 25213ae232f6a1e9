//! Background simulation scheduler
//!
//! One cancellable tokio task per active portfolio advances its clock in real
//! time. Alongside each loop the scheduler keeps store streams on the portfolio
//! record and on every held symbol's price history, relayed to the broadcaster.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broadcast::{PortfolioBroadcaster, PortfolioEvent};
use crate::config::SimulationConfig;
use crate::error::Result;
use crate::persistence::{paths, Store, SubscriptionHandle};
use crate::service::{PortfolioService, TickOutcome};
use crate::types::Portfolio;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&SimulationConfig> for SchedulerConfig {
    fn from(cfg: &SimulationConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            stop_timeout: cfg.stop_timeout(),
        }
    }
}

struct SimulationTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct StreamRegistration {
    handle: SubscriptionHandle,
    relay: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, SimulationTask>,
    streams: HashMap<String, Vec<StreamRegistration>>,
}

/// Outcome of tearing down one portfolio's loop and streams
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub portfolio_id: String,
    pub loop_stopped: bool,
    pub streams_closed: usize,
    pub errors: Vec<String>,
}

impl CleanupReport {
    fn new(portfolio_id: &str) -> Self {
        Self {
            portfolio_id: portfolio_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct SimulationScheduler {
    service: Arc<PortfolioService>,
    broadcaster: PortfolioBroadcaster,
    config: SchedulerConfig,
    registry: Mutex<Registry>,
}

impl SimulationScheduler {
    pub fn new(
        service: Arc<PortfolioService>,
        broadcaster: PortfolioBroadcaster,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            service,
            broadcaster,
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn broadcaster(&self) -> &PortfolioBroadcaster {
        &self.broadcaster
    }

    /// Ensure exactly one loop runs for `portfolio_id`, restarting any
    /// existing one.
    pub async fn start(&self, portfolio_id: &str) -> Result<Portfolio> {
        let previous = self.detach(portfolio_id).await;
        if previous.loop_stopped {
            debug!(portfolio_id, "[SIM] Restarting existing loop");
            log_report(&previous);
        }

        let portfolio = self.service.activate_for_simulation(portfolio_id).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.service.clone(),
            self.broadcaster.clone(),
            portfolio_id.to_string(),
            self.config.poll_interval,
            shutdown_rx,
        ));
        let streams = self.open_streams(&portfolio).await;

        let (displaced_task, displaced_streams) = {
            let mut registry = self.registry.lock().await;
            (
                registry
                    .tasks
                    .insert(portfolio_id.to_string(), SimulationTask { shutdown, handle }),
                registry.streams.insert(portfolio_id.to_string(), streams),
            )
        };

        if displaced_task.is_some() || displaced_streams.is_some() {
            warn!(portfolio_id, "⚠️ [SIM] Concurrent start displaced a loop, stopping it");
            let report = self
                .teardown(
                    portfolio_id,
                    displaced_task,
                    displaced_streams.unwrap_or_default(),
                )
                .await;
            log_report(&report);
        }

        info!(
            portfolio_id,
            date = %portfolio.current_date,
            speed = portfolio.simulation_speed,
            "▶️ [SIM] Simulation running"
        );
        self.broadcaster.publish(PortfolioEvent::SimulationStarted {
            portfolio_id: portfolio_id.to_string(),
            current_date: portfolio.current_date,
            simulation_speed: portfolio.simulation_speed,
        });
        Ok(portfolio)
    }

    /// Stop the loop, close its streams and mark the portfolio inactive.
    /// Every step runs even if an earlier one failed.
    pub async fn stop(&self, portfolio_id: &str) -> CleanupReport {
        let Some(mut report) = self.unregister(portfolio_id).await else {
            return CleanupReport::new(portfolio_id);
        };

        if let Err(e) = self.service.deactivate(portfolio_id).await {
            report.errors.push(format!("mark inactive: {}", e));
        }

        self.broadcaster.publish(PortfolioEvent::SimulationStopped {
            portfolio_id: portfolio_id.to_string(),
        });
        log_report(&report);
        report
    }

    /// Take down a registered loop and its streams. The stored record is left
    /// as it is.
    async fn detach(&self, portfolio_id: &str) -> CleanupReport {
        self.unregister(portfolio_id)
            .await
            .unwrap_or_else(|| CleanupReport::new(portfolio_id))
    }

    /// Remove and tear down the registry entry; `None` when nothing was registered
    async fn unregister(&self, portfolio_id: &str) -> Option<CleanupReport> {
        let (task, streams) = {
            let mut registry = self.registry.lock().await;
            (
                registry.tasks.remove(portfolio_id),
                registry.streams.remove(portfolio_id),
            )
        };

        if task.is_none() && streams.is_none() {
            return None;
        }
        Some(
            self.teardown(portfolio_id, task, streams.unwrap_or_default())
                .await,
        )
    }

    /// Stop everything. The registry is empty afterwards.
    pub async fn shutdown_all(&self) -> Vec<CleanupReport> {
        let ids: Vec<String> = {
            let registry = self.registry.lock().await;
            let mut ids: Vec<String> = registry
                .tasks
                .keys()
                .chain(registry.streams.keys())
                .cloned()
                .collect();
            ids.sort();
            ids.dedup();
            ids
        };

        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            reports.push(self.stop(&id).await);
        }

        // Anything registered while we were stopping
        let leftovers = {
            let mut registry = self.registry.lock().await;
            let tasks: Vec<_> = registry.tasks.drain().collect();
            let streams: HashMap<_, _> = registry.streams.drain().collect();
            (tasks, streams)
        };
        let (tasks, mut streams) = leftovers;
        for (id, task) in tasks {
            let regs = streams.remove(&id).unwrap_or_default();
            reports.push(self.teardown(&id, Some(task), regs).await);
        }
        for (id, regs) in streams {
            reports.push(self.teardown(&id, None, regs).await);
        }

        info!(stopped = reports.len(), "⏹️ [SIM] All simulations stopped");
        reports
    }

    /// True while a registered loop for `portfolio_id` is still executing
    pub async fn is_running(&self, portfolio_id: &str) -> bool {
        let registry = self.registry.lock().await;
        registry
            .tasks
            .get(portfolio_id)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn running_count(&self) -> usize {
        let registry = self.registry.lock().await;
        registry
            .tasks
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    pub async fn stream_count(&self, portfolio_id: &str) -> usize {
        let registry = self.registry.lock().await;
        registry.streams.get(portfolio_id).map(Vec::len).unwrap_or(0)
    }

    /// Signal, join with timeout, close streams. Does not touch storage.
    async fn teardown(
        &self,
        portfolio_id: &str,
        task: Option<SimulationTask>,
        streams: Vec<StreamRegistration>,
    ) -> CleanupReport {
        let mut report = CleanupReport::new(portfolio_id);

        if let Some(SimulationTask { shutdown, mut handle }) = task {
            // The loop may already have exited on its own
            let _ = shutdown.send(true);
            match timeout(self.config.stop_timeout, &mut handle).await {
                Ok(Ok(())) => report.loop_stopped = true,
                Ok(Err(e)) if e.is_cancelled() => report.loop_stopped = true,
                Ok(Err(e)) => report.errors.push(format!("loop task failed: {}", e)),
                Err(_) => {
                    handle.abort();
                    report.loop_stopped = true;
                    report.errors.push(format!(
                        "loop did not stop within {:?}, aborted",
                        self.config.stop_timeout
                    ));
                }
            }
        }

        for mut registration in streams {
            match registration.handle.close() {
                Ok(()) => report.streams_closed += 1,
                Err(e) => report
                    .errors
                    .push(format!("close stream {}: {}", registration.handle.path(), e)),
            }
            registration.relay.abort();
        }
        report
    }

    /// Streams on the record and on each holding's price history. Failures
    /// are logged and skipped.
    async fn open_streams(&self, portfolio: &Portfolio) -> Vec<StreamRegistration> {
        let store = self.service.repository().store().clone();
        let mut registrations = Vec::with_capacity(portfolio.holdings.len() + 1);

        match self.open_record_stream(&store, &portfolio.id).await {
            Ok(reg) => registrations.push(reg),
            Err(e) => warn!(portfolio_id = %portfolio.id, error = %e, "⚠️ [SIM] Portfolio stream not registered"),
        }

        for holding in &portfolio.holdings {
            match self
                .open_history_stream(&store, &portfolio.id, &holding.symbol)
                .await
            {
                Ok(reg) => registrations.push(reg),
                Err(e) => warn!(
                    portfolio_id = %portfolio.id,
                    symbol = %holding.symbol,
                    error = %e,
                    "⚠️ [SIM] Price history stream not registered"
                ),
            }
        }
        registrations
    }

    async fn open_record_stream(
        &self,
        store: &Arc<dyn Store>,
        portfolio_id: &str,
    ) -> std::result::Result<StreamRegistration, crate::error::StoreError> {
        let (mut updates, handle) = store.stream(&paths::portfolio(portfolio_id)).await?.into_parts();
        let broadcaster = self.broadcaster.clone();
        let id = portfolio_id.to_string();
        let history_root = paths::stock_history_root(portfolio_id);

        let relay = tokio::spawn(async move {
            while let Some(event) = updates.recv().await {
                // Price history has its own streams
                if event.path == history_root || event.is_below(&history_root) {
                    continue;
                }
                broadcaster.publish(PortfolioEvent::PortfolioUpdated {
                    portfolio_id: id.clone(),
                    change: event.kind,
                    payload: event.data,
                });
            }
        });
        Ok(StreamRegistration { handle, relay })
    }

    async fn open_history_stream(
        &self,
        store: &Arc<dyn Store>,
        portfolio_id: &str,
        symbol: &str,
    ) -> std::result::Result<StreamRegistration, crate::error::StoreError> {
        let (mut updates, handle) = store
            .stream(&paths::stock_history(portfolio_id, symbol))
            .await?
            .into_parts();
        let broadcaster = self.broadcaster.clone();
        let id = portfolio_id.to_string();
        let symbol = symbol.to_string();

        let relay = tokio::spawn(async move {
            while let Some(event) = updates.recv().await {
                broadcaster.publish(PortfolioEvent::PriceHistoryUpdated {
                    portfolio_id: id.clone(),
                    symbol: symbol.clone(),
                    payload: event.data,
                });
            }
        });
        Ok(StreamRegistration { handle, relay })
    }
}

fn log_report(report: &CleanupReport) {
    if report.is_clean() {
        debug!(
            portfolio_id = %report.portfolio_id,
            streams = report.streams_closed,
            "[SIM] Cleanup complete"
        );
    } else {
        for error in &report.errors {
            warn!(portfolio_id = %report.portfolio_id, error = %error, "⚠️ [SIM] Cleanup step failed");
        }
    }
}

async fn run_loop(
    service: Arc<PortfolioService>,
    broadcaster: PortfolioBroadcaster,
    portfolio_id: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(portfolio_id = %portfolio_id, "[SIM] Loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match service.tick(&portfolio_id, Utc::now()).await {
            Ok(TickOutcome::Missing) => {
                warn!(portfolio_id = %portfolio_id, "⚠️ [SIM] Portfolio no longer exists, ending loop");
                break;
            }
            Ok(TickOutcome::Advanced {
                days,
                current_date,
                current_balance,
            }) => {
                info!(
                    portfolio_id = %portfolio_id,
                    days,
                    date = %current_date,
                    balance = current_balance,
                    "⏩ [SIM] Clock advanced"
                );
                broadcaster.publish(PortfolioEvent::SimulationAdvanced {
                    portfolio_id: portfolio_id.clone(),
                    days,
                    current_date,
                    current_balance,
                });
            }
            Ok(outcome) => debug!(portfolio_id = %portfolio_id, ?outcome, "[SIM] Tick"),
            Err(e) => warn!(
                portfolio_id = %portfolio_id,
                error = %e,
                retryable = e.is_retryable(),
                "⚠️ [SIM] Tick failed, retrying next interval"
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(portfolio_id = %portfolio_id, "[SIM] Loop exited");
}
