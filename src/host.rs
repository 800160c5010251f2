//! Host resource pool: resident VMs, admission control and the per-host
//! migration lock.

use crate::{
    LivemigError, Result, log_debug, log_info, log_warn,
    vm::{VirtualMachine, VmState},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub capacity_mb: u64,
}

struct Resident {
    vm: Arc<VirtualMachine>,
    dormant: bool,
}

pub struct Host {
    name: String,
    capacity_mb: u64,
    residents: Mutex<Vec<Resident>>,
    migration_in_progress: AtomicBool,
}

impl Host {
    pub fn new(name: impl Into<String>, capacity_mb: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            capacity_mb,
            residents: Mutex::new(Vec::new()),
            migration_in_progress: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &HostConfig) -> Arc<Self> {
        Self::new(config.name.clone(), config.capacity_mb)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity_mb(&self) -> u64 {
        self.capacity_mb
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Resident>> {
        self.residents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_of(residents: &[Resident]) -> u64 {
        residents.iter().map(|r| r.vm.memory_mb()).sum()
    }

    fn percent_of(&self, load_mb: u64) -> f64 {
        if self.capacity_mb == 0 {
            return 0.0;
        }
        load_mb as f64 / self.capacity_mb as f64 * 100.0
    }

    fn ensure_absent(&self, residents: &[Resident], vm_id: u32) -> Result<()> {
        if residents.iter().any(|r| r.vm.id() == vm_id) {
            return Err(LivemigError::DuplicateVm {
                host: self.name.clone(),
                vm_id,
            });
        }
        Ok(())
    }

    fn ensure_fits(&self, residents: &[Resident], vm_id: u32, memory_mb: u64) -> Result<()> {
        let load_mb = Self::load_of(residents);
        if load_mb + memory_mb > self.capacity_mb {
            return Err(LivemigError::AdmissionDenied {
                host: self.name.clone(),
                vm_id,
                requested_mb: memory_mb,
                load_mb,
                capacity_mb: self.capacity_mb,
            });
        }
        Ok(())
    }

    /// Admit a running VM if it fits, and start its workload.
    pub fn admit_active(&self, vm: Arc<VirtualMachine>) -> Result<()> {
        let mut residents = self.lock();
        self.ensure_absent(&residents, vm.id())?;
        if let Err(err) = self.ensure_fits(&residents, vm.id(), vm.memory_mb()) {
            log_warn!("{}", err);
            return Err(err);
        }

        vm.start_workload();
        residents.push(Resident {
            vm: vm.clone(),
            dormant: false,
        });
        log_info!("{} started on host {}", vm, self.name);
        Ok(())
    }

    /// Register a reservation without any capacity check or workload.
    pub fn admit_dormant(&self, vm: Arc<VirtualMachine>) -> Result<()> {
        let mut residents = self.lock();
        self.ensure_absent(&residents, vm.id())?;
        residents.push(Resident {
            vm: vm.clone(),
            dormant: true,
        });
        log_info!("Dormant {} reserved on host {}", vm, self.name);
        Ok(())
    }

    /// Capacity-checked dormant reservation. The check and the insert happen
    /// under one lock, so no concurrent admission can slip in between.
    pub fn reserve(&self, vm: Arc<VirtualMachine>) -> Result<()> {
        let mut residents = self.lock();
        self.ensure_absent(&residents, vm.id())?;
        self.ensure_fits(&residents, vm.id(), vm.memory_mb())?;
        residents.push(Resident {
            vm: vm.clone(),
            dormant: true,
        });
        log_info!("Reserved {} on host {}", vm, self.name);
        Ok(())
    }

    /// Turn a dormant reservation into an active VM and start its workload.
    ///
    /// Capacity was settled when the reservation was made, so it is not
    /// checked again here.
    pub fn activate(&self, vm_id: u32) -> Result<Arc<VirtualMachine>> {
        let mut residents = self.lock();
        let resident = residents
            .iter_mut()
            .find(|r| r.vm.id() == vm_id && r.dormant)
            .ok_or_else(|| LivemigError::VmNotFound {
                host: self.name.clone(),
                vm_id,
            })?;

        resident.dormant = false;
        resident.vm.set_state(VmState::Running);
        resident.vm.start_workload();
        log_info!("{} activated on host {}", resident.vm, self.name);
        Ok(resident.vm.clone())
    }

    /// Remove a VM and stop its workload. Evicting an absent VM is a no-op.
    pub async fn evict(&self, vm_id: u32) -> Result<Option<Arc<VirtualMachine>>> {
        let removed = {
            let mut residents = self.lock();
            residents
                .iter()
                .position(|r| r.vm.id() == vm_id)
                .map(|index| residents.remove(index))
        };

        let Some(resident) = removed else {
            log_debug!("VM-{} not resident on {}, nothing to evict", vm_id, self.name);
            return Ok(None);
        };

        resident.vm.stop_workload().await?;
        log_info!("{} removed from host {}", resident.vm, self.name);
        Ok(Some(resident.vm))
    }

    /// Evict every resident VM, reporting the first shutdown failure.
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<u32> = self.lock().iter().map(|r| r.vm.id()).collect();
        let mut first_error = None;
        for id in ids {
            if let Err(err) = self.evict(id).await {
                log_warn!("Failed to stop VM-{} on {}: {}", id, self.name, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Memory of every resident VM, dormant reservations included.
    pub fn current_load_mb(&self) -> u64 {
        Self::load_of(&self.lock())
    }

    pub fn active_load_mb(&self) -> u64 {
        self.lock()
            .iter()
            .filter(|r| !r.dormant)
            .map(|r| r.vm.memory_mb())
            .sum()
    }

    pub fn load_percent(&self) -> f64 {
        self.percent_of(self.current_load_mb())
    }

    pub fn vm(&self, vm_id: u32) -> Option<Arc<VirtualMachine>> {
        self.lock()
            .iter()
            .find(|r| r.vm.id() == vm_id)
            .map(|r| r.vm.clone())
    }

    pub fn is_active(&self, vm_id: u32) -> bool {
        self.lock()
            .iter()
            .any(|r| r.vm.id() == vm_id && !r.dormant)
    }

    pub fn vms(&self) -> Vec<Arc<VirtualMachine>> {
        self.lock().iter().map(|r| r.vm.clone()).collect()
    }

    /// First active VM in admission order that is still running.
    pub fn select_migration_candidate(&self) -> Result<Arc<VirtualMachine>> {
        self.lock()
            .iter()
            .find(|r| !r.dormant && r.vm.state() == VmState::Running)
            .map(|r| r.vm.clone())
            .ok_or_else(|| LivemigError::NoEligibleVm(self.name.clone()))
    }

    pub fn is_migration_in_progress(&self) -> bool {
        self.migration_in_progress.load(Ordering::Acquire)
    }

    /// Take the migration lock or fail immediately; never waits.
    pub fn try_lock_migration(self: &Arc<Self>) -> Result<MigrationGuard> {
        self.migration_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LivemigError::MigrationAlreadyInProgress(self.name.clone()))?;
        log_info!("Host {} is now locked for migration", self.name);
        Ok(MigrationGuard { host: self.clone() })
    }

    pub fn status(&self) -> HostStatus {
        let residents = self.lock();
        let load_mb = Self::load_of(&residents);
        HostStatus {
            name: self.name.clone(),
            load_mb,
            capacity_mb: self.capacity_mb,
            load_percent: self.percent_of(load_mb),
            migration_in_progress: self.is_migration_in_progress(),
            vms: residents
                .iter()
                .map(|r| VmSummary {
                    id: r.vm.id(),
                    memory_mb: r.vm.memory_mb(),
                    state: r.vm.state(),
                    dormant: r.dormant,
                })
                .collect(),
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("capacity_mb", &self.capacity_mb)
            .field("migration_in_progress", &self.is_migration_in_progress())
            .finish_non_exhaustive()
    }
}

/// Held for the whole lifetime of a migration; dropping it clears the flag.
#[derive(Debug)]
pub struct MigrationGuard {
    host: Arc<Host>,
}

impl MigrationGuard {
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        self.host.migration_in_progress.store(false, Ordering::Release);
        log_info!("Host {} is now unlocked for migration", self.host.name);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub id: u32,
    pub memory_mb: u64,
    pub state: VmState,
    pub dormant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatus {
    pub name: String,
    pub load_mb: u64,
    pub capacity_mb: u64,
    pub load_percent: f64,
    pub migration_in_progress: bool,
    pub vms: Vec<VmSummary>,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATUS: Host {} | Load: {}/{} MB ({:.1}%) | In Migration: {} | VMs: [",
            self.name, self.load_mb, self.capacity_mb, self.load_percent, self.migration_in_progress
        )?;
        for (i, vm) in self.vms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "VM-{} ({} MB, {}", vm.id, vm.memory_mb, vm.state)?;
            if vm.dormant {
                write!(f, ", dormant")?;
            }
            write!(f, ")")?;
        }
        write!(f, "]")
    }
}
