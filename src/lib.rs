pub mod config;
pub mod error;
pub mod host;
pub mod logger;
pub mod memory;
pub mod migration;
pub mod monitor;
pub mod post_copy;
pub mod pre_copy;
pub mod vm;

pub use error::LivemigError;

pub type Result<T> = std::result::Result<T, LivemigError>;

pub use config::{SimConfig, VmConfig};
pub use host::{Host, HostStatus, MigrationGuard};
pub use memory::{DirtySet, PAGE_SIZE_BYTES, PagedMemory};
pub use migration::{
    MigrationConfig, MigrationHandle, MigrationOrchestrator, MigrationPhase, MigrationReport,
    StopReason, StrategyKind,
};
pub use monitor::{LoadMonitor, MonitorConfig, MonitorHandle, PollOutcome};
pub use vm::{VirtualMachine, VmState, WorkloadConfig, WorkloadPolicy};
