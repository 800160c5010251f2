use crate::{
    LivemigError, Result, log_debug, log_warn,
    memory::{PagedMemory, pages_for},
};
use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Running,
    Migrating,
    Paused,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Running => write!(f, "running"),
            VmState::Migrating => write!(f, "migrating"),
            VmState::Paused => write!(f, "paused"),
        }
    }
}

/// Whether the workload keeps dirtying memory while its VM is being migrated.
///
/// Writes always stop at stop-and-copy regardless of policy: the source region
/// is frozen together with the final dirty snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadPolicy {
    #[default]
    ContinueDuringMigration,
    PauseDuringMigration,
}

impl WorkloadPolicy {
    pub fn writes_in(&self, state: VmState) -> bool {
        match (self, state) {
            (_, VmState::Running) => true,
            (WorkloadPolicy::ContinueDuringMigration, VmState::Migrating) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub policy: WorkloadPolicy,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            policy: WorkloadPolicy::default(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

fn default_tick_ms() -> u64 {
    100
}

fn default_stop_timeout_ms() -> u64 {
    1000
}

struct WorkloadTask {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct VirtualMachine {
    id: u32,
    memory_mb: u64,
    dirty_rate_pps: AtomicU32,
    memory: PagedMemory,
    state: Mutex<VmState>,
    workload_config: WorkloadConfig,
    started: AtomicBool,
    workload: Mutex<Option<WorkloadTask>>,
}

impl VirtualMachine {
    pub fn new(
        id: u32,
        memory_mb: u64,
        dirty_rate_pps: u32,
        workload_config: WorkloadConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            memory_mb,
            dirty_rate_pps: AtomicU32::new(dirty_rate_pps),
            memory: PagedMemory::new(pages_for(memory_mb)),
            state: Mutex::new(VmState::Running),
            workload_config,
            started: AtomicBool::new(false),
            workload: Mutex::new(None),
        })
    }

    /// Destination-side reservation: same identity and size, no workload.
    pub fn placeholder(id: u32, memory_mb: u64, workload_config: WorkloadConfig) -> Arc<Self> {
        Self::new(id, memory_mb, 0, workload_config)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    pub fn total_pages(&self) -> usize {
        self.memory.total_pages()
    }

    pub fn memory(&self) -> &PagedMemory {
        &self.memory
    }

    pub fn dirty_rate_pps(&self) -> u32 {
        self.dirty_rate_pps.load(Ordering::Relaxed)
    }

    pub fn set_dirty_rate(&self, pages_per_second: u32) {
        self.dirty_rate_pps.store(pages_per_second, Ordering::Relaxed);
    }

    fn lock_state(&self) -> MutexGuard<'_, VmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> VmState {
        *self.lock_state()
    }

    pub fn set_state(&self, state: VmState) {
        let mut current = self.lock_state();
        if *current != state {
            log_debug!("{} state {} -> {}", self, *current, state);
            *current = state;
        }
    }

    pub fn workload_running(&self) -> bool {
        self.workload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.join.is_finished())
    }

    /// Launch the background workload. Only the first call has any effect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_workload(self: &Arc<Self>) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(run_workload(
            Arc::downgrade(self),
            self.workload_config.clone(),
            stop_rx,
        ));

        *self.workload.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(WorkloadTask { stop_tx, join });
        log_debug!("{} workload started", self);
        true
    }

    /// Signal the workload to exit and wait for it, bounded by the configured
    /// stop timeout. Safe to call repeatedly.
    pub async fn stop_workload(&self) -> Result<()> {
        let task = self
            .workload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Ok(());
        };

        let _ = task.stop_tx.send(true);
        let timeout = Duration::from_millis(self.workload_config.stop_timeout_ms);
        let abort = task.join.abort_handle();

        match tokio::time::timeout(timeout, task.join).await {
            Ok(joined) => {
                joined?;
                log_debug!("{} workload stopped", self);
                Ok(())
            }
            Err(_) => {
                abort.abort();
                log_warn!("{} workload ignored stop signal for {:?}", self, timeout);
                Err(LivemigError::ShutdownTimeout {
                    what: format!("{} workload", self),
                    timeout,
                })
            }
        }
    }
}

impl fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VM-{} ({} MB)", self.id, self.memory_mb)
    }
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.id)
            .field("memory_mb", &self.memory_mb)
            .field("dirty_rate_pps", &self.dirty_rate_pps())
            .field("state", &self.state())
            .finish()
    }
}

async fn run_workload(
    vm: Weak<VirtualMachine>,
    config: WorkloadConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    let tick = Duration::from_millis(config.tick_ms);
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rng = StdRng::from_entropy();

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        let Some(vm) = vm.upgrade() else {
            break;
        };
        if !config.policy.writes_in(vm.state()) {
            continue;
        }

        let pages = (vm.dirty_rate_pps() as u64 * config.tick_ms / 1000) as usize;
        let total = vm.total_pages();
        if pages == 0 || total == 0 {
            continue;
        }

        let writes: Vec<(usize, u32)> = (0..pages)
            .map(|_| (rng.gen_range(0..total), rng.next_u32()))
            .collect();
        vm.memory().write_batch(&writes);
    }
}
