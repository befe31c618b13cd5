/// peerchat - decentralized chat peer
///
/// This binary:
/// - Registers the peer's address with the directory server
/// - Receives messages from other peers, pinning each sender's certificate
/// - Sends messages to peers resolved through the directory
/// - Shows the local message history

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use peerchat_common::{PeerConfig, Username};
use peerchat_core::transport::client_config;
use peerchat_core::{
    Connector, DirectoryClient, HistoryStore, JsonHistory, PeerMessagingClient,
    PeerMessagingService, Shutdown, TlsIdentity, TrustStore,
};
use peerchat_daemon::{init_logging, load_or_create, log_config_source};

const CONFIG_FILE: &str = "peerchat.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(());
        }
        "version" | "--version" | "-v" => {
            println!("peerchat v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let config_path = PathBuf::from(CONFIG_FILE);
    let (config, defaulted) = load_or_create::<PeerConfig>(&config_path)?;
    init_logging(config.verbose);
    log_config_source(&config_path, defaulted);

    match command {
        "keygen" => keygen(&config, args.get(2).map(String::as_str) == Some("--force")),
        "serve" => serve(config).await,
        "send" => {
            let (Some(recipient), true) = (args.get(2), args.len() > 3) else {
                bail!("Usage: peerchat send <username> <message>");
            };
            let recipient = Username::new(recipient.as_str())?;
            send(config, &recipient, &args[3..].join(" ")).await
        }
        "history" => {
            let Some(chat) = args.get(2) else {
                bail!("Usage: peerchat history <username>");
            };
            show_history(&config, &Username::new(chat.as_str())?)
        }
        "chats" => show_chats(&config),
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }
}

/// Generate this peer's certificate and key
fn keygen(config: &PeerConfig, force: bool) -> Result<()> {
    let cert_path = config.cert_path();
    if cert_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to replace it (peers that pinned the old certificate will reject you)",
            cert_path.display()
        );
    }

    let username = own_username(config)?;
    let identity = TlsIdentity::generate_to_files(username.as_str(), &cert_path, &config.key_path())?;
    info!("Generated identity for {} in {:?}", username, config.data_dir);
    println!("Fingerprint: {}", peerchat_core::fingerprint(identity.certificate()));
    Ok(())
}

/// Register with the directory, then receive messages until Ctrl+C
async fn serve(config: PeerConfig) -> Result<()> {
    let identity = load_identity(&config)?;
    let history = open_history(&config)?;
    let client = messaging_client(&config, &identity, history.clone())?;

    client
        .register()
        .await
        .with_context(|| format!("Failed to register with directory {}", config.lookup_socket()))?;

    let trust = Arc::new(TrustStore::new(history));
    let service = PeerMessagingService::bind(&config, &identity, trust).await?;

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();
    info!("Receiving messages as {}. Press Ctrl+C to stop.", client.username());

    service.run(shutdown).await?;
    info!("Stopped");
    Ok(())
}

async fn send(config: PeerConfig, recipient: &Username, content: &str) -> Result<()> {
    let identity = load_identity(&config)?;
    let history = open_history(&config)?;
    let client = messaging_client(&config, &identity, history)?;

    client
        .send(recipient, content)
        .await
        .with_context(|| format!("Failed to send to {}", recipient))?;
    println!("Delivered to {}", recipient);
    Ok(())
}

fn show_history(config: &PeerConfig, chat: &Username) -> Result<()> {
    let history = open_history(config)?;
    let entries = history.query(chat)?;
    if entries.is_empty() {
        println!("No messages with {}", chat);
        return Ok(());
    }

    let own = own_username(config)?;
    for entry in entries {
        let author = if entry.direction.is_sent() { own.as_str() } else { chat.as_str() };
        println!("[{}] {}: {}", entry.timestamp, author, entry.content);
    }
    Ok(())
}

fn show_chats(config: &PeerConfig) -> Result<()> {
    let history = open_history(config)?;
    let chats = history.chats()?;
    if chats.is_empty() {
        println!("No chats yet");
    }
    for chat in chats {
        println!("{}", chat);
    }
    Ok(())
}

fn own_username(config: &PeerConfig) -> Result<Username> {
    Username::new(config.username.as_str())
        .with_context(|| format!("Invalid username {:?} in {}", config.username, CONFIG_FILE))
}

fn load_identity(config: &PeerConfig) -> Result<TlsIdentity> {
    TlsIdentity::load(&config.cert_path(), &config.key_path())
        .context("Failed to load identity; run 'peerchat keygen' first")
}

fn open_history(config: &PeerConfig) -> Result<Arc<JsonHistory>> {
    let path = config.history_path();
    let history = JsonHistory::open(&path)
        .with_context(|| format!("Failed to open history {}", path.display()))?;
    Ok(Arc::new(history))
}

fn messaging_client(
    config: &PeerConfig,
    identity: &TlsIdentity,
    history: Arc<JsonHistory>,
) -> Result<PeerMessagingClient> {
    let connector = Connector::new(client_config(identity)?, config.io_timeout());
    let directory = DirectoryClient::new(connector.clone(), config.lookup_socket(), config.io_timeout());

    Ok(PeerMessagingClient::new(
        own_username(config)?,
        directory,
        connector,
        config.peer_port,
        history,
        config.io_timeout(),
    ))
}

/// Print help message
fn print_help() {
    println!("peerchat - decentralized chat peer");
    println!();
    println!("USAGE:");
    println!("    peerchat <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    keygen [--force]            Generate this peer's certificate and key");
    println!("    serve                       Register with the directory and receive messages");
    println!("    send <username> <message>   Send a message to a peer");
    println!("    history <username>          Show messages exchanged with a peer");
    println!("    chats                       List known chats");
    println!("    help                        Show this help message");
    println!("    version                     Show version information");
    println!();
    println!("Settings are read from ./{} (written with defaults on first run).", CONFIG_FILE);
}
