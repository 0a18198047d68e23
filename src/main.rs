use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use facegate::service::protocol::ResultStatus;
use facegate::service::{GateClient, GateResponse};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(about = "Client for the facegate access service")]
struct Cli {
    /// Server address
    #[arg(long, global = true, default_value = "127.0.0.1:7700")]
    addr: String,

    /// API credential sent with every frame
    #[arg(long, global = true, default_value = "")]
    credential: String,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the person in the given frames
    Identify {
        /// Image files, sent in order as camera frames
        #[arg(short, long, required = true, num_args = 1..)]
        image: Vec<PathBuf>,
    },
    /// Enroll a new user from the given frames
    Enroll {
        #[arg(short, long)]
        uid: String,
        /// Image files, sent in order as camera frames
        #[arg(short, long, required = true, num_args = 1..)]
        image: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Identify { image } => {
            let frames = load_frames(&image)?;
            println!("🔐 Connecting to {}...", cli.addr);
            let mut client = GateClient::connect(&cli.addr, &cli.credential)?;
            let response = client.identify(&frames, print_progress)?;
            client.close();
            print_outcome(&response);
        }
        Commands::Enroll { uid, image } => {
            let frames = load_frames(&image)?;
            println!("🔐 Connecting to {}...", cli.addr);
            let mut client = GateClient::connect(&cli.addr, &cli.credential)?;
            let response = client.enroll(&frames, &uid, print_progress)?;
            client.close();
            print_outcome(&response);
        }
    }

    Ok(())
}

fn load_frames(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths
        .iter()
        .map(|path| {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        })
        .collect()
}

fn print_progress(response: &GateResponse) {
    println!("👁  {}", response.message);
}

fn print_outcome(response: &GateResponse) {
    match response.status {
        ResultStatus::Found | ResultStatus::Enrolled => {
            println!("✅ {}", response.message);
            if let Some(uid) = &response.uid {
                println!("   uid: {}", uid);
            }
        }
        _ => {
            println!("❌ {}", response.message);
            if let Some(uid) = &response.uid {
                println!("   uid: {}", uid);
            }
        }
    }
}

fn setup_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(std::io::stderr)
            .init();
    }
}
