use anyhow::{Context, anyhow};
use clap::{Parser, ValueEnum};
use livemig::{
    Host, LoadMonitor, MigrationOrchestrator, MigrationReport, SimConfig, StrategyKind,
    VirtualMachine, logger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{Duration, Instant, sleep_until, timeout};

#[derive(Parser)]
#[command(name = "livemig")]
#[command(about = "Simulate host-load-driven live migration of a virtual machine")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to a TOML scenario file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Memory of the VM to be migrated (MB)
    #[arg(long)]
    vm_size: Option<u64>,

    /// Page dirty rate of the VM to be migrated (pages per second)
    #[arg(long)]
    dirty_rate: Option<u32>,

    /// Migration link bandwidth (Mbps)
    #[arg(long)]
    link_speed: Option<u32>,

    /// Migration algorithm
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Real seconds per simulated second of transfer
    #[arg(long)]
    time_scale: Option<f64>,

    /// Give up if no migration finishes within this many seconds
    #[arg(long, default_value_t = 600)]
    deadline_secs: u64,

    /// Print the migration report as JSON
    #[arg(long)]
    json: bool,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    write_default_config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    PreCopy,
    PostCopy,
}

impl From<StrategyArg> for StrategyKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::PreCopy => StrategyKind::PreCopy,
            StrategyArg::PostCopy => StrategyKind::PostCopy,
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SimConfig> {
    let path = cli.config.clone().or_else(|| {
        SimConfig::default_path().filter(|p| p.exists())
    });

    let mut config = match path {
        Some(path) => SimConfig::from_file(&path)
            .with_context(|| format!("loading scenario from {}", path.display()))?,
        None => {
            logger::info!("No scenario file found, using built-in defaults");
            SimConfig::default()
        }
    };

    // Command-line overrides target the first VM, the one that gets migrated.
    if let Some(target) = config.vms.first_mut() {
        if let Some(size) = cli.vm_size {
            target.memory_mb = size;
        }
        if let Some(rate) = cli.dirty_rate {
            target.dirty_rate_pps = rate;
        }
    }
    if let Some(speed) = cli.link_speed {
        config.monitor.link_speed_mbps = speed;
    }
    if let Some(strategy) = cli.strategy {
        config.migration.strategy = strategy.into();
    }
    if let Some(scale) = cli.time_scale {
        config.migration.time_scale = scale;
    }

    config.validate().context("invalid scenario")?;
    Ok(config)
}

fn print_report(report: &MigrationReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "livemig=debug");
        }
    }
    logger::init_logger();

    let config = load_config(&cli)?;
    if let Some(path) = &cli.write_default_config {
        config.save_to_file(path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    if let Some(target) = config.vms.first() {
        println!("--- Starting simulation ---");
        println!(
            "VM to be migrated -> VM-{} | Size: {} MB | Page dirty rate: {} pps",
            target.id, target.memory_mb, target.dirty_rate_pps
        );
        println!(
            "Migration network -> {} Mbps | Strategy: {}",
            config.monitor.link_speed_mbps, config.migration.strategy
        );
        println!("---------------------------");
    }

    let source = Host::from_config(&config.source_host);
    let destination = Host::from_config(&config.destination_host);
    let orchestrator = Arc::new(MigrationOrchestrator::new(
        config.migration.clone(),
        config.workload.clone(),
    ));

    let mut delayed = Vec::new();
    for vm in &config.vms {
        let machine = VirtualMachine::new(
            vm.id,
            vm.memory_mb,
            vm.dirty_rate_pps,
            config.workload.clone(),
        );
        if vm.admit_after_ms == 0 {
            if let Err(err) = source.admit_active(machine) {
                logger::warn!("{}", err);
            }
        } else {
            delayed.push((Duration::from_millis(vm.admit_after_ms), machine));
        }
    }
    delayed.sort_by_key(|(delay, _)| *delay);

    let mut monitor = LoadMonitor::new(
        source.clone(),
        destination.clone(),
        orchestrator,
        config.monitor.clone(),
    )
    .spawn();

    let admissions = {
        let source = source.clone();
        let start = Instant::now();
        tokio::spawn(async move {
            for (delay, machine) in delayed {
                sleep_until(start + delay).await;
                logger::info!("ACTION: adding {} to host {}", machine, source.name());
                if let Err(err) = source.admit_active(machine) {
                    logger::warn!("{}", err);
                }
            }
        })
    };

    let deadline = Duration::from_secs(cli.deadline_secs);
    let outcome = tokio::select! {
        waited = timeout(deadline, async {
            match monitor.next_migration().await {
                Some(handle) => Some(handle.wait().await),
                None => None,
            }
        }) => waited,
        _ = tokio::signal::ctrl_c() => {
            logger::warn!("Interrupted, shutting down");
            Ok(None)
        }
    };

    admissions.abort();
    let stopped = monitor.stop().await;

    let result = match outcome {
        Ok(Some(Ok(report))) => print_report(&report, cli.json),
        Ok(Some(Err(err))) => Err(err).context("migration failed"),
        Ok(None) => Ok(()),
        Err(_) => Err(anyhow!("no migration completed within {:?}", deadline)),
    };

    println!("{}", source.status());
    println!("{}", destination.status());

    stopped.context("stopping monitor")?;
    source.shutdown().await.context("stopping source host")?;
    destination
        .shutdown()
        .await
        .context("stopping destination host")?;
    result
}
