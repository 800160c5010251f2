use crate::{
    LivemigError, Result, log_debug, log_info, log_warn,
    host::Host,
    migration::{MigrationHandle, MigrationOrchestrator},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_load_threshold_percent")]
    pub load_threshold_percent: u32,
    #[serde(default = "default_link_speed_mbps")]
    pub link_speed_mbps: u32,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            load_threshold_percent: default_load_threshold_percent(),
            link_speed_mbps: default_link_speed_mbps(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_load_threshold_percent() -> u32 {
    80
}

fn default_link_speed_mbps() -> u32 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

/// Result of a single load check.
#[derive(Debug)]
pub enum PollOutcome {
    BelowThreshold { load_percent: f64 },
    /// Overloaded, but a migration from this host is already running.
    Locked { load_percent: f64 },
    Triggered(MigrationHandle),
    NoEligibleVm,
    /// The orchestrator refused the migration.
    Rejected(LivemigError),
}

/// Watches a source host and moves a VM to the destination when it runs hot.
pub struct LoadMonitor {
    source: Arc<Host>,
    destination: Arc<Host>,
    orchestrator: Arc<MigrationOrchestrator>,
    config: MonitorConfig,
}

impl LoadMonitor {
    pub fn new(
        source: Arc<Host>,
        destination: Arc<Host>,
        orchestrator: Arc<MigrationOrchestrator>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            source,
            destination,
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn poll_once(&self) -> PollOutcome {
        let status = self.source.status();
        log_info!("{}", status);
        log_info!("{}", self.destination.status());

        let load_percent = status.load_percent;
        if load_percent <= self.config.load_threshold_percent as f64 {
            return PollOutcome::BelowThreshold { load_percent };
        }
        if self.source.is_migration_in_progress() {
            log_debug!(
                "Host {} overloaded at {:.1}% but already migrating",
                self.source.name(),
                load_percent
            );
            return PollOutcome::Locked { load_percent };
        }

        log_warn!(
            "ALERT: Host {} load is at {:.1}% (threshold {}%), triggering migration",
            self.source.name(),
            load_percent,
            self.config.load_threshold_percent
        );

        let vm = match self.source.select_migration_candidate() {
            Ok(vm) => vm,
            Err(err) => {
                log_warn!("ALERT: {}", err);
                return PollOutcome::NoEligibleVm;
            }
        };

        match self.orchestrator.migrate(
            vm,
            &self.source,
            &self.destination,
            self.config.link_speed_mbps,
        ) {
            Ok(handle) => PollOutcome::Triggered(handle),
            Err(err) => {
                log_warn!("Migration not started: {}", err);
                PollOutcome::Rejected(err)
            }
        }
    }

    /// Run the poll loop on its own task until stopped.
    pub fn spawn(self) -> MonitorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (migrations_tx, migrations_rx) = mpsc::unbounded_channel();
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let shutdown_timeout = Duration::from_millis(self.config.shutdown_timeout_ms);

        let join = tokio::spawn(async move {
            log_info!(
                "Monitoring host {} every {:?} (threshold {}%)",
                self.source.name(),
                interval,
                self.config.load_threshold_percent
            );
            loop {
                if let PollOutcome::Triggered(handle) = self.poll_once() {
                    // Nobody listening is fine; the migration runs regardless.
                    let _ = migrations_tx.send(handle);
                }

                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = sleep(interval) => {}
                }
            }
            log_info!("Monitor for host {} stopped", self.source.name());
        });

        MonitorHandle {
            stop_tx,
            join,
            migrations: migrations_rx,
            shutdown_timeout,
        }
    }
}

pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    migrations: mpsc::UnboundedReceiver<MigrationHandle>,
    shutdown_timeout: Duration,
}

impl MonitorHandle {
    /// Next migration the monitor triggers, or `None` once it has stopped.
    pub async fn next_migration(&mut self) -> Option<MigrationHandle> {
        self.migrations.recv().await
    }

    pub fn try_next_migration(&mut self) -> Option<MigrationHandle> {
        self.migrations.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Interrupt the poll loop and wait for it to exit. In-flight migrations
    /// keep running.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        let abort = self.join.abort_handle();
        match tokio::time::timeout(self.shutdown_timeout, self.join).await {
            Ok(joined) => Ok(joined?),
            Err(_) => {
                abort.abort();
                Err(LivemigError::ShutdownTimeout {
                    what: "load monitor".to_string(),
                    timeout: self.shutdown_timeout,
                })
            }
        }
    }
}
