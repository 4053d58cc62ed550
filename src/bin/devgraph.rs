use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use devgraph::config::{ConfigOverrides, DiscoveryOverrides, StoreOverrides};
use devgraph::discovery::{self, MockupTransport};
use devgraph::payload::encode_payload;
use devgraph::{DevgraphConfig, DeviceStore, FileStore, Reconciler, SnapshotId, SnapshotStore};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"devgraph - hardware inventory snapshot reconciliation

USAGE:
    devgraph <COMMAND> [OPTIONS]

COMMANDS:
    collect --mockup <DIR> [--name <NAME>]    Walk a Redfish mockup and submit a snapshot
    submit --payload <FILE> [--name <NAME>]   Submit a payload file as a snapshot
    reconcile --snapshot <ID>                 Reconcile one snapshot
    reconcile --pending                       Reconcile every non-terminal snapshot
    devices                                   Print device records as JSON lines
    snapshots                                 Print snapshot ids, phases and messages

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -d, --data-dir <DIR>    Override the store directory [default: ./devgraph-data]
    -h, --help              Print help

ENVIRONMENT:
    DEVGRAPH_CONFIG                  Path to config file
    DEVGRAPH_STORE__DATA_DIR         Store directory
    DEVGRAPH_DISCOVERY__MOCKUP_DIR   Default mockup directory
    DEVGRAPH_LOGGING__FILTER         Log filter when RUST_LOG is unset
"#
    );
}

fn init_logging(config: &DevgraphConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let command = std::env::args().nth(1);
    if command.is_none() || has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }
    let command = command.unwrap_or_default();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    if let Some(dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        overrides.store = Some(StoreOverrides {
            data_dir: Some(dir.into()),
        });
    }
    if let Some(dir) = parse_arg("--mockup") {
        overrides.discovery = Some(DiscoveryOverrides {
            mockup_dir: Some(dir.into()),
        });
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("DEVGRAPH_CONFIG").ok());
    let config = DevgraphConfig::load(config_path.as_deref(), overrides)?;
    init_logging(&config);

    let store = Arc::new(FileStore::open(&config.store.data_dir)?);
    let reconciler = Reconciler::with_store(store.clone());

    match command.as_str() {
        "collect" => {
            let mockup: PathBuf = config
                .discovery
                .mockup_dir
                .clone()
                .ok_or_else(|| anyhow!("--mockup is required"))?;
            let transport = MockupTransport::new(&mockup);
            let candidates = discovery::collect(&transport, &config.discovery.service_root)
                .with_context(|| format!("redfish discovery failed for {}", mockup.display()))?;
            let raw_data = encode_payload(&candidates)?;
            let uid = reconciler.submit(parse_arg("--name"), raw_data)?;
            println!("Found {} devices. Created snapshot {uid}", candidates.len());
        }
        "submit" => {
            let path = parse_arg("--payload").ok_or_else(|| anyhow!("--payload is required"))?;
            let raw_data = fs::read_to_string(&path)
                .with_context(|| format!("failed to read payload {path}"))?;
            let uid = reconciler.submit(parse_arg("--name"), raw_data)?;
            println!("Created snapshot {uid}");
        }
        "reconcile" => {
            if has_flag("--pending") {
                for (uid, result) in reconciler.reconcile_pending()? {
                    match result {
                        Ok(status) => println!("{uid}\t{}\t{}", status.phase, status.message),
                        Err(err) => println!("{uid}\tnot reconciled\t{err}"),
                    }
                }
            } else {
                let uid = parse_arg("--snapshot")
                    .ok_or_else(|| anyhow!("--snapshot or --pending is required"))?;
                let status = reconciler.reconcile(&SnapshotId(uid.clone()))?;
                println!("{uid}\t{}\t{}", status.phase, status.message);
            }
        }
        "devices" => {
            let mut devices = store.list_devices()?;
            devices.sort_by(|a, b| a.uid().cmp(b.uid()));
            for device in devices {
                println!("{}", serde_json::to_string(&device)?);
            }
        }
        "snapshots" => {
            let mut snapshots = store.list_snapshots()?;
            snapshots.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
            for snapshot in snapshots {
                println!(
                    "{}\t{}\t{}\t{}",
                    snapshot.uid(),
                    snapshot.name(),
                    snapshot.status.phase,
                    snapshot.status.message
                );
            }
        }
        other => {
            print_help();
            bail!("unknown command: {other}");
        }
    }

    Ok(())
}
