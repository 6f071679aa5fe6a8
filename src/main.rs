use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use simple_logger::SimpleLogger;

use cashew::config::NodeConfig;
use cashew::gossip::InMemoryTransport;
use cashew::identity::NodeIdentity;
use cashew::node::CashewNode;
use cashew::storage::FsBackend;

/// Seconds between periodic persists of ledger and network state
const PERSIST_INTERVAL_SECONDS: u64 = 60;

fn main() {
    SimpleLogger::new().init().unwrap();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./cashew.yaml"));

    let config = match NodeConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    // Fatal setup failures: data directory and identity must exist
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        eprintln!("cannot create data directory: {e}");
        std::process::exit(1);
    }
    let password = std::env::var("CASHEW_IDENTITY_PASSWORD").ok();
    let identity = match NodeIdentity::load_or_generate(&config.identity_file, password.as_deref())
    {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("cannot load identity: {e}");
            std::process::exit(1);
        }
    };

    let backend = match FsBackend::new(config.storage_path()) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("cannot open content storage: {e}");
            std::process::exit(1);
        }
    };

    // The socket transport lives outside the core; until one is attached,
    // the in-memory transport keeps a single node functional
    let transport = InMemoryTransport::new();

    let node = match CashewNode::new(config, identity, Box::new(transport), Box::new(backend)) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            eprintln!("cannot construct node: {e}");
            std::process::exit(1);
        }
    };

    info!("node id: {}", node.node_id());
    node.bootstrap();
    node.start();

    info!("running");
    loop {
        std::thread::sleep(Duration::from_secs(PERSIST_INTERVAL_SECONDS));
        if let Err(e) = node.persist() {
            // In-memory state stays authoritative; retry next interval
            log::warn!("periodic persist failed: {e}");
        }
    }
}
