mod commands;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "roomdrop - send a file to whoever joins the same room")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a config file (TOML). Defaults to ~/.config/roomdrop/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rendezvous relay.
    Relay {
        /// Address to listen on.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Offer a file in a room and send it to the first peer that joins.
    Send {
        file: PathBuf,
        /// Room name. A random one is generated when omitted.
        #[arg(long)]
        room: Option<String>,
        /// Rendezvous relay URL.
        #[arg(long)]
        url: Option<String>,
    },
    /// Join a room and save the file its peer sends.
    Receive {
        room: String,
        /// Directory to write the file into.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Relay { listen } => commands::relay(listen.unwrap_or(config.relay_listen)).await,
        Command::Send { file, room, url } => {
            let room = room.unwrap_or_else(commands::random_room);
            let url = url.unwrap_or_else(|| config.signaling_url.clone());
            commands::send(&config, &url, &room, &file).await
        }
        Command::Receive { room, out, url } => {
            let url = url.unwrap_or_else(|| config.signaling_url.clone());
            let dir = out.unwrap_or_else(|| config.download_dir.clone());
            let path = commands::receive(&config, &url, &room, &dir).await?;
            println!("saved {}", path.display());
            Ok(())
        }
    }
}
