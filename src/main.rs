use clap::{Parser, Subcommand};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;

use harbor::cryptography::generate_encryption_key;
use harbor::server::{FileServer, ServerConfig};
use harbor::KEY_SIZE;

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Peer-to-peer encrypted content-addressed file store", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage node
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        listen: SocketAddr,
        /// Storage root directory (default: <port>_network)
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Peer addresses to dial at startup
        #[arg(short, long)]
        bootstrap: Vec<SocketAddr>,
        /// Path to a shared encryption key file (see `keygen`)
        #[arg(short, long)]
        key_file: Option<PathBuf>,
    },
    /// Generate a shared encryption key file
    Keygen {
        /// Where to write the key
        #[arg(default_value = "harbor.key")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve {
            listen,
            root,
            bootstrap,
            key_file,
        } => serve(listen, root, bootstrap, key_file).await?,
        Commands::Keygen { path } => keygen(&path)?,
    }

    Ok(())
}

async fn serve(
    listen: SocketAddr,
    root: Option<PathBuf>,
    bootstrap: Vec<SocketAddr>,
    key_file: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let mut config = ServerConfig::new(listen);
    config.storage_root = root.unwrap_or_else(|| PathBuf::from(format!("{}_network", listen.port())));
    config.bootstrap_nodes = bootstrap;

    match key_file {
        Some(path) => config.encrypt_key = load_key(&path)?,
        None => log::warn!(
            "no --key-file given; using an ephemeral key, replicated files \
             will not decrypt across nodes"
        ),
    }

    let server = FileServer::new(config);
    let handle = tokio::spawn(server.clone().start());

    tokio::signal::ctrl_c().await?;
    println!("Shutting down");
    server.stop();
    handle.await??;

    Ok(())
}

fn keygen(path: &PathBuf) -> Result<(), Box<dyn Error>> {
    let key = generate_encryption_key();
    std::fs::write(path, hex::encode(key))?;
    println!("Wrote encryption key to {}", path.display());
    Ok(())
}

fn load_key(path: &PathBuf) -> Result<[u8; KEY_SIZE], Box<dyn Error>> {
    let encoded = std::fs::read_to_string(path)?;
    let bytes = hex::decode(encoded.trim())?;
    let key: [u8; KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| format!("key file must contain {} hex-encoded bytes", KEY_SIZE))?;
    Ok(key)
}
