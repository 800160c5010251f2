// Integration tests for the host load monitor
use livemig::{
    Host, LivemigError, LoadMonitor, MigrationConfig, MigrationOrchestrator, MonitorConfig,
    PollOutcome, VirtualMachine, WorkloadConfig,
};
use std::sync::Arc;
use tokio::time::{Duration, timeout};

fn monitor_for(source: &Arc<Host>, destination: &Arc<Host>, config: MonitorConfig) -> LoadMonitor {
    let orchestrator = Arc::new(MigrationOrchestrator::new(
        MigrationConfig::default(),
        WorkloadConfig::default(),
    ));
    LoadMonitor::new(source.clone(), destination.clone(), orchestrator, config)
}

fn vm(id: u32, memory_mb: u64, rate: u32) -> Arc<VirtualMachine> {
    VirtualMachine::new(id, memory_mb, rate, WorkloadConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_overload_triggers_migration_of_first_vm() {
    let source = Host::new("Host-A", 8192);
    let destination = Host::new("Host-B", 8192);
    source.admit_active(vm(1, 2048, 15000)).unwrap();
    source.admit_active(vm(2, 4096, 5000)).unwrap();

    let mut monitor = monitor_for(&source, &destination, MonitorConfig::default()).spawn();

    // 6144/8192 = 75% stays under the threshold.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(monitor.try_next_migration().is_none());

    source.admit_active(vm(3, 2048, 8000)).unwrap();
    let handle = timeout(Duration::from_millis(5_100), monitor.next_migration())
        .await
        .expect("monitor should react within one poll interval")
        .expect("monitor stopped unexpectedly");
    assert_eq!(handle.vm_id(), 1);

    let report = handle.wait().await.unwrap();
    assert_eq!(report.vm_id, 1);
    assert_eq!(report.source_host, "Host-A");
    assert_eq!(report.destination_host, "Host-B");
    assert!(destination.is_active(1));
    assert_eq!(source.current_load_mb(), 6144);
    assert_eq!(destination.current_load_mb(), 2048);

    monitor.stop().await.unwrap();
    source.shutdown().await.unwrap();
    destination.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poll_below_threshold_does_nothing() {
    let source = Host::new("Host-A", 8192);
    let destination = Host::new("Host-B", 8192);
    source.admit_active(vm(1, 4096, 0)).unwrap();

    let monitor = monitor_for(&source, &destination, MonitorConfig::default());
    match monitor.poll_once() {
        PollOutcome::BelowThreshold { load_percent } => assert_eq!(load_percent, 50.0),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!source.is_migration_in_progress());
    source.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_locked_host_is_not_retriggered() {
    let source = Host::new("Host-A", 1024);
    let destination = Host::new("Host-B", 8192);
    source.admit_active(vm(1, 1024, 0)).unwrap();

    let monitor = monitor_for(&source, &destination, MonitorConfig::default());
    let guard = source.try_lock_migration().unwrap();
    assert!(matches!(monitor.poll_once(), PollOutcome::Locked { .. }));
    drop(guard);

    let PollOutcome::Triggered(handle) = monitor.poll_once() else {
        panic!("expected a migration once the lock is released");
    };
    assert!(matches!(
        monitor.poll_once(),
        PollOutcome::BelowThreshold { .. } | PollOutcome::Locked { .. }
    ));
    handle.wait().await.unwrap();
    source.shutdown().await.unwrap();
    destination.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_overload_without_running_vm_is_reported() {
    let source = Host::new("Host-A", 1024);
    let destination = Host::new("Host-B", 8192);
    source
        .admit_dormant(VirtualMachine::placeholder(1, 1024, WorkloadConfig::default()))
        .unwrap();

    let monitor = monitor_for(&source, &destination, MonitorConfig::default());
    assert!(matches!(monitor.poll_once(), PollOutcome::NoEligibleVm));
    assert!(!source.is_migration_in_progress());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_migration_keeps_monitor_alive() {
    let source = Host::new("Host-A", 2048);
    let destination = Host::new("Host-B", 1024);
    source.admit_active(vm(1, 2048, 0)).unwrap();

    let monitor = monitor_for(&source, &destination, MonitorConfig::default());
    assert!(matches!(
        monitor.poll_once(),
        PollOutcome::Rejected(LivemigError::AdmissionDenied { .. })
    ));
    assert!(!source.is_migration_in_progress());
    source.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_interrupts_long_poll_interval() {
    let source = Host::new("Host-A", 8192);
    let destination = Host::new("Host-B", 8192);
    let config = MonitorConfig {
        poll_interval_ms: 3_600_000,
        shutdown_timeout_ms: 1_000,
        ..MonitorConfig::default()
    };

    let handle = monitor_for(&source, &destination, config).spawn();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    handle.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_stop_reports_timeout_when_loop_does_not_exit() {
    let source = Host::new("Host-A", 8192);
    let destination = Host::new("Host-B", 8192);
    let config = MonitorConfig {
        shutdown_timeout_ms: 0,
        ..MonitorConfig::default()
    };

    let handle = monitor_for(&source, &destination, config).spawn();
    tokio::time::sleep(Duration::from_millis(10)).await;

    match handle.stop().await {
        Err(LivemigError::ShutdownTimeout { what, timeout }) => {
            assert_eq!(what, "load monitor");
            assert_eq!(timeout, Duration::ZERO);
        }
        other => panic!("expected ShutdownTimeout, got {:?}", other),
    }
}
