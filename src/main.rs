use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod api;
mod chain;
mod config;
mod fingerprint;
mod gate;
mod normalize;
mod similarity;
mod store;

use chain::Ledger;
use config::Cfg;
use gate::{RegisterError, RegistrationGate};
use store::ImageStore;

#[derive(Parser)]
#[command(name = "imgchain", about = "Image copyright registry on a hash-chained ledger")]
struct Cli {
    /// Optional YAML config file. Env vars (IMGCHAIN_*) override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve {
        /// Bind address, e.g. 0.0.0.0:3000.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Register an image file on the chain.
    Register {
        image: PathBuf,
        #[arg(long)]
        owner: String,
    },
    /// Check an image against the chain without registering it.
    Verify { image: PathBuf },
    /// Validate the integrity of the persisted chain.
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = Cfg::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind } => {
            if let Some(b) = bind {
                cfg.bind = b;
            }
            api::serve(cfg).await
        }
        Command::Register { image, owner } => {
            let raw = std::fs::read(&image)?;
            let mut ledger = Ledger::load(&cfg.ledger_path)?;
            let gate = new_gate(&cfg);
            match gate.register(&raw, &owner, &mut ledger) {
                Ok(block) => {
                    println!(
                        "registered block {} for {} (hash {})",
                        block.index, block.data.owner, block.hash
                    );
                    Ok(())
                }
                Err(RegisterError::Duplicate(dup)) => {
                    report_duplicate(&dup);
                    std::process::exit(1);
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Verify { image } => {
            let raw = std::fs::read(&image)?;
            let ledger = Ledger::load(&cfg.ledger_path)?;
            let gate = new_gate(&cfg);
            match gate.check_duplicate(&raw, &ledger)? {
                Some(dup) => {
                    report_duplicate(&dup);
                    std::process::exit(1);
                }
                None => {
                    println!("no registered duplicate found");
                    Ok(())
                }
            }
        }
        Command::Validate => {
            let ledger = Ledger::load(&cfg.ledger_path)?;
            if ledger.validate() {
                println!("chain is valid ({} blocks)", ledger.len());
                Ok(())
            } else {
                eprintln!("chain is INVALID ({} blocks)", ledger.len());
                std::process::exit(1);
            }
        }
    }
}

fn new_gate(cfg: &Cfg) -> RegistrationGate {
    RegistrationGate::new(ImageStore::new(&cfg.image_dir), cfg.similarity_threshold)
}

fn report_duplicate(dup: &gate::Duplicate) {
    let block = dup.block();
    let kind = if dup.is_exact() {
        "byte-identical to"
    } else {
        "visually similar to"
    };
    eprintln!(
        "rejected: image is {kind} block {} (owner {}, registered {})",
        block.index, block.data.owner, block.data.timestamp
    );
}
