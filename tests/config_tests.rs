// Integration tests for scenario files on disk
use livemig::{LivemigError, SimConfig, StrategyKind, VmConfig};
use tempfile::TempDir;

#[test]
fn test_save_and_reload_scenario() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("livemig.toml");

    let mut config = SimConfig::default();
    config.migration.strategy = StrategyKind::PostCopy;
    config.monitor.link_speed_mbps = 10_000;
    config.vms.push(VmConfig {
        id: 4,
        memory_mb: 512,
        dirty_rate_pps: 100,
        admit_after_ms: 2_500,
    });
    config.save_to_file(&path).unwrap();
    assert!(path.exists());

    let loaded = SimConfig::from_file(&path).unwrap();
    assert_eq!(loaded.migration.strategy, StrategyKind::PostCopy);
    assert_eq!(loaded.monitor.link_speed_mbps, 10_000);
    assert_eq!(loaded.vms, config.vms);
    assert_eq!(loaded.source_host.name, "Host-A");
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let result = SimConfig::from_file(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(LivemigError::Io(_))));
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(
        &path,
        "[source_host]\nname = \"Host-A\"\ncapacity_mb = 0\n",
    )
    .unwrap();

    assert!(matches!(
        SimConfig::from_file(&path),
        Err(LivemigError::InvalidConfig(_))
    ));
}
