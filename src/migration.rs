use crate::{
    LivemigError, Result, log_debug, log_error, log_info, log_warn,
    host::{Host, MigrationGuard},
    memory::PAGE_SIZE_BYTES,
    post_copy::PostCopy,
    pre_copy::PreCopy,
    vm::{VirtualMachine, VmState, WorkloadConfig},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    PreCopy,
    PostCopy,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::PreCopy => write!(f, "pre-copy"),
            StrategyKind::PostCopy => write!(f, "post-copy"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Upper bound on iterative pre-copy rounds after the initial full copy.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// A round with fewer dirty pages than this ends pre-copy.
    #[serde(default = "default_min_dirty_pages")]
    pub min_dirty_pages: usize,
    /// Pre-copy stops once this many multiples of guest memory were sent.
    #[serde(default = "default_max_data_sent_factor")]
    pub max_data_sent_factor: f64,
    /// Real seconds slept per simulated second of link transfer.
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    #[serde(default = "default_post_copy_batch_pages")]
    pub post_copy_batch_pages: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            max_iterations: default_max_iterations(),
            min_dirty_pages: default_min_dirty_pages(),
            max_data_sent_factor: default_max_data_sent_factor(),
            time_scale: default_time_scale(),
            post_copy_batch_pages: default_post_copy_batch_pages(),
        }
    }
}

fn default_max_iterations() -> u32 {
    29
}

fn default_min_dirty_pages() -> usize {
    50
}

fn default_max_data_sent_factor() -> f64 {
    3.0
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_post_copy_batch_pages() -> usize {
    8192
}

/// Pages per second a link of `link_speed_mbps` can carry.
pub fn link_capacity_pps(link_speed_mbps: u32) -> f64 {
    let bytes_per_second = link_speed_mbps as f64 * 1_000_000.0 / 8.0;
    bytes_per_second / PAGE_SIZE_BYTES as f64
}

/// Simulated seconds needed to push `pages` over the link.
pub fn transfer_seconds(pages: usize, link_capacity_pps: f64) -> f64 {
    if pages == 0 {
        return 0.0;
    }
    pages as f64 / link_capacity_pps
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum MigrationPhase {
    Reserving,
    PreCopy { iteration: u32 },
    StopAndCopy,
    Activating,
    PostCopy { remaining_pages: usize },
    Done,
    Failed,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPhase::Reserving => write!(f, "reserving"),
            MigrationPhase::PreCopy { iteration } => write!(f, "pre-copy round {}", iteration),
            MigrationPhase::StopAndCopy => write!(f, "stop-and-copy"),
            MigrationPhase::Activating => write!(f, "activating"),
            MigrationPhase::PostCopy { remaining_pages } => {
                write!(f, "post-copy ({} pages pending)", remaining_pages)
            }
            MigrationPhase::Done => write!(f, "done"),
            MigrationPhase::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// A round's dirty set fell under the minimum; it went to stop-and-copy.
    Converged,
    IterationLimit,
    DataLimit,
    /// The strategy has no iterative phase.
    NotApplicable,
}

/// What a strategy reports back to the orchestrator.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub stop_reason: StopReason,
    pub final_copy_pages: usize,
    pub demand_faults: u64,
    pub zero_pages_skipped: usize,
}

/// State of one migration, owned by the task that runs it.
pub struct MigrationSession {
    pub id: Uuid,
    pub source_vm: Arc<VirtualMachine>,
    pub source_host: Arc<Host>,
    pub destination_host: Arc<Host>,
    pub destination_vm: Arc<VirtualMachine>,
    pub link_speed_mbps: u32,
    pub config: MigrationConfig,
    pub iterations: u32,
    pub pages_sent: u64,
    pub started_at: DateTime<Utc>,
    phase_tx: watch::Sender<MigrationPhase>,
}

impl MigrationSession {
    pub fn link_capacity_pps(&self) -> f64 {
        link_capacity_pps(self.link_speed_mbps)
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase_tx.borrow()
    }

    pub fn enter(&self, phase: MigrationPhase) {
        log_info!("MIGRATION {}: {} entering {}", self.id, self.source_vm, phase);
        self.phase_tx.send_replace(phase);
    }

    /// Block this session for the link time of `pages` and return the
    /// simulated seconds it represents. Only this task sleeps.
    pub async fn pay_transfer(&self, pages: usize) -> f64 {
        let seconds = transfer_seconds(pages, self.link_capacity_pps());
        let real = seconds * self.config.time_scale;
        if real > 0.0 {
            sleep(Duration::from_secs_f64(real)).await;
        }
        seconds
    }
}

#[async_trait]
pub trait MigrationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Move memory and switch the VM over. On success the source VM has left
    /// its host and the destination reservation is active.
    async fn run(&self, session: &mut MigrationSession) -> Result<StrategyOutcome>;
}

pub fn strategy_for(kind: StrategyKind) -> Arc<dyn MigrationStrategy> {
    match kind {
        StrategyKind::PreCopy => Arc::new(PreCopy),
        StrategyKind::PostCopy => Arc::new(PostCopy),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub session_id: Uuid,
    pub vm_id: u32,
    pub memory_mb: u64,
    pub source_host: String,
    pub destination_host: String,
    pub strategy: StrategyKind,
    pub link_speed_mbps: u32,
    pub iterations: u32,
    pub pages_sent: u64,
    pub stop_reason: StopReason,
    pub final_copy_pages: usize,
    pub demand_faults: u64,
    pub zero_pages_skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Migration {} of VM-{} ({} MB) {} -> {} [{}]",
            self.session_id,
            self.vm_id,
            self.memory_mb,
            self.source_host,
            self.destination_host,
            self.strategy
        )?;
        writeln!(
            f,
            "  rounds: {} | pages sent: {} | stop: {:?} | final copy: {} pages",
            self.iterations, self.pages_sent, self.stop_reason, self.final_copy_pages
        )?;
        if self.strategy == StrategyKind::PostCopy {
            writeln!(
                f,
                "  demand faults: {} | zero pages skipped: {}",
                self.demand_faults, self.zero_pages_skipped
            )?;
        }
        write!(
            f,
            "  started {} | finished {} | took {:.3} s",
            self.started_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.finished_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.duration_ms as f64 / 1000.0
        )
    }
}

/// Handle to a migration running in the background.
#[derive(Debug)]
pub struct MigrationHandle {
    session_id: Uuid,
    vm_id: u32,
    phase_rx: watch::Receiver<MigrationPhase>,
    join: JoinHandle<Result<MigrationReport>>,
}

impl MigrationHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn vm_id(&self) -> u32 {
        self.vm_id
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase_rx.borrow()
    }

    /// A receiver that observes every phase change.
    pub fn watch_phase(&self) -> watch::Receiver<MigrationPhase> {
        self.phase_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<MigrationReport> {
        self.join.await?
    }
}

pub struct MigrationOrchestrator {
    config: MigrationConfig,
    workload_config: WorkloadConfig,
    strategy: Arc<dyn MigrationStrategy>,
}

impl MigrationOrchestrator {
    pub fn new(config: MigrationConfig, workload_config: WorkloadConfig) -> Self {
        let strategy = strategy_for(config.strategy);
        Self::with_strategy(config, workload_config, strategy)
    }

    pub fn with_strategy(
        config: MigrationConfig,
        workload_config: WorkloadConfig,
        strategy: Arc<dyn MigrationStrategy>,
    ) -> Self {
        Self {
            config,
            workload_config,
            strategy,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Start migrating `source_vm` from `source_host` to `destination_host`.
    ///
    /// Locks both hosts and reserves the destination before returning; the
    /// copy itself runs on its own task. Fails fast with
    /// `MigrationAlreadyInProgress` if either host is already locked.
    pub fn migrate(
        &self,
        source_vm: Arc<VirtualMachine>,
        source_host: &Arc<Host>,
        destination_host: &Arc<Host>,
        link_speed_mbps: u32,
    ) -> Result<MigrationHandle> {
        if Arc::ptr_eq(source_host, destination_host) {
            return Err(LivemigError::InvalidConfig(format!(
                "source and destination are the same host '{}'",
                source_host.name()
            )));
        }
        if link_speed_mbps == 0 {
            return Err(LivemigError::InvalidConfig(
                "link speed must be positive".to_string(),
            ));
        }

        let source_guard = source_host.try_lock_migration()?;
        let destination_guard = destination_host.try_lock_migration()?;

        if !source_host.is_active(source_vm.id()) {
            return Err(LivemigError::VmNotFound {
                host: source_host.name().to_string(),
                vm_id: source_vm.id(),
            });
        }
        let state = source_vm.state();
        if state != VmState::Running {
            return Err(LivemigError::VmNotRunning {
                vm_id: source_vm.id(),
                state: state.to_string(),
            });
        }

        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let (phase_tx, phase_rx) = watch::channel(MigrationPhase::Reserving);
        log_info!(
            "MIGRATION {}: starting {} {} -> {} at {} over {} Mbps ({})",
            session_id,
            source_vm,
            source_host.name(),
            destination_host.name(),
            started_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            link_speed_mbps,
            self.strategy.kind()
        );

        let destination_vm = VirtualMachine::placeholder(
            source_vm.id(),
            source_vm.memory_mb(),
            self.workload_config.clone(),
        );
        destination_host.reserve(destination_vm.clone())?;
        source_vm.set_state(VmState::Migrating);

        let session = MigrationSession {
            id: session_id,
            source_vm: source_vm.clone(),
            source_host: source_host.clone(),
            destination_host: destination_host.clone(),
            destination_vm,
            link_speed_mbps,
            config: self.config.clone(),
            iterations: 0,
            pages_sent: 0,
            started_at,
            phase_tx,
        };

        let strategy = self.strategy.clone();
        let join = tokio::spawn(run_session(
            strategy,
            session,
            source_guard,
            destination_guard,
        ));

        Ok(MigrationHandle {
            session_id,
            vm_id: source_vm.id(),
            phase_rx,
            join,
        })
    }
}

async fn run_session(
    strategy: Arc<dyn MigrationStrategy>,
    mut session: MigrationSession,
    _source_guard: MigrationGuard,
    _destination_guard: MigrationGuard,
) -> Result<MigrationReport> {
    let clock = Instant::now();

    let outcome = match strategy.run(&mut session).await {
        Ok(outcome) => outcome,
        Err(err) => {
            log_error!("MIGRATION {}: {} failed: {}", session.id, session.source_vm, err);
            roll_back(&session).await;
            session.enter(MigrationPhase::Failed);
            return Err(err);
        }
    };

    session.enter(MigrationPhase::Done);
    let finished_at = Utc::now();
    let elapsed = clock.elapsed();
    log_info!(
        "MIGRATION {}: completed for {} at {}, total time {:.3} s",
        session.id,
        session.destination_vm,
        finished_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        elapsed.as_secs_f64()
    );

    Ok(MigrationReport {
        session_id: session.id,
        vm_id: session.source_vm.id(),
        memory_mb: session.source_vm.memory_mb(),
        source_host: session.source_host.name().to_string(),
        destination_host: session.destination_host.name().to_string(),
        strategy: strategy.kind(),
        link_speed_mbps: session.link_speed_mbps,
        iterations: session.iterations,
        pages_sent: session.pages_sent,
        stop_reason: outcome.stop_reason,
        final_copy_pages: outcome.final_copy_pages,
        demand_faults: outcome.demand_faults,
        zero_pages_skipped: outcome.zero_pages_skipped,
        started_at: session.started_at,
        finished_at,
        duration_ms: elapsed.as_millis() as u64,
    })
}

/// Undo a reservation after a failed run. A source that was already frozen
/// stays paused; there is no way back from stop-and-copy.
async fn roll_back(session: &MigrationSession) {
    let vm_id = session.destination_vm.id();
    if session.destination_host.is_active(vm_id) {
        log_warn!(
            "MIGRATION {}: destination VM-{} already active, keeping it",
            session.id,
            vm_id
        );
        return;
    }
    // A frozen source that already left its host only lives on in the
    // reservation.
    if session.source_vm.memory().is_frozen() && !session.source_host.is_active(vm_id) {
        match session.destination_host.activate(vm_id) {
            Ok(_) => log_warn!(
                "MIGRATION {}: source of VM-{} is gone, activated the reservation",
                session.id,
                vm_id
            ),
            Err(err) => log_error!(
                "MIGRATION {}: VM-{} could not be recovered: {}",
                session.id,
                vm_id,
                err
            ),
        }
        return;
    }
    if let Err(err) = session.destination_host.evict(vm_id).await {
        log_warn!("MIGRATION {}: could not drop reservation: {}", session.id, err);
    }
    if !session.source_vm.memory().is_frozen() {
        session.source_vm.set_state(VmState::Running);
        log_debug!("MIGRATION {}: {} resumed on source", session.id, session.source_vm);
    }
}
