/// peerchat-lookup - directory server
///
/// Usage: peerchat-lookup [keygen [--force]]
///
/// Loads the address table from disk, answers Update and Fetch requests
/// until Ctrl+C, then writes the table back.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use peerchat_common::DirectoryConfig;
use peerchat_core::directory::store;
use peerchat_core::{DirectoryService, JsonHistory, Shutdown, TlsIdentity, TrustStore};
use peerchat_daemon::{init_logging, load_or_create, log_config_source};

const CONFIG_FILE: &str = "peerchat-lookup.toml";

/// Subject of the directory's generated certificate
const SUBJECT: &str = "peerchat-lookup";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config_path = PathBuf::from(CONFIG_FILE);
    let (config, defaulted) = load_or_create::<DirectoryConfig>(&config_path)?;
    init_logging(config.verbose);
    log_config_source(&config_path, defaulted);

    match args.get(1).map(String::as_str) {
        None | Some("serve") => serve(config).await,
        Some("keygen") => keygen(&config, args.get(2).map(String::as_str) == Some("--force")),
        Some("version" | "--version" | "-v") => {
            println!("peerchat-lookup v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Usage: peerchat-lookup [serve | keygen [--force] | version]");
            std::process::exit(1);
        }
    }
}

fn keygen(config: &DirectoryConfig, force: bool) -> Result<()> {
    let cert_path = config.cert_path();
    if cert_path.exists() && !force {
        bail!("{} already exists; pass --force to replace it", cert_path.display());
    }
    TlsIdentity::generate_to_files(SUBJECT, &cert_path, &config.key_path())?;
    info!("Generated directory identity in {:?}", config.data_dir);
    Ok(())
}

async fn serve(config: DirectoryConfig) -> Result<()> {
    info!("Starting peerchat-lookup v{}", env!("CARGO_PKG_VERSION"));

    let identity = TlsIdentity::load(&config.cert_path(), &config.key_path())
        .context("Failed to load identity; run 'peerchat-lookup keygen' first")?;

    let table_path = config.table_path();
    let table = store::load(&table_path, config.initial_capacity, config.max_capacity)
        .with_context(|| format!("Failed to load table {}", table_path.display()))?;
    info!("Loaded {} entries from {:?}", table.len(), table_path);

    let pins = if config.pin_updates {
        let pins_path = config.pins_path();
        let history = JsonHistory::open(&pins_path)
            .with_context(|| format!("Failed to open pin store {}", pins_path.display()))?;
        Some(Arc::new(TrustStore::new(Arc::new(history))))
    } else {
        warn!("Update pinning disabled; any client may re-register any username");
        None
    };

    let service = DirectoryService::bind(&config, table, &identity, pins).await?;
    let table = service.table();

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();
    info!("Directory is running. Press Ctrl+C to stop.");

    service.run(shutdown).await?;

    let table = table.read().await;
    store::save(&table, &table_path)
        .with_context(|| format!("Failed to save table {}", table_path.display()))?;
    info!("Directory stopped");
    Ok(())
}
