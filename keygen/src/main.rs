use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use courier_common::{
    config::{BACKEND_ROLE, CLIENT_ROLE, FRONTEND_ROLE, WORKER_ROLE},
    KeyStore, PublicKey,
};

#[derive(Parser)]
#[command(name = "courier-keygen")]
#[command(about = "Generate and authorize Courier keypairs")]
struct Args {
    /// Key store location (defaults to $COURIER_KEYS_DIR, then keys/)
    #[arg(short, long)]
    keys_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create keypairs for every standard role that is still missing
    Init,
    /// Generate a fresh keypair for one role, replacing any existing one
    Generate {
        #[arg(short, long)]
        role: String,
    },
    /// Print the public key stored for a role
    Show {
        #[arg(short, long)]
        role: String,
    },
    /// Add a public key to the authorized-peer listing
    Authorize {
        /// Name the key is listed under
        #[arg(short, long)]
        name: String,
        /// Copy the public key of a stored role
        #[arg(short, long, conflicts_with = "key")]
        role: Option<String>,
        /// Literal hex-encoded public key
        #[arg(short, long)]
        key: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let store = match args.keys_dir {
        Some(dir) => KeyStore::open(dir),
        None => KeyStore::from_env(),
    };

    match args.command {
        Command::Init => {
            for role in [FRONTEND_ROLE, BACKEND_ROLE, WORKER_ROLE, CLIENT_ROLE] {
                let pair = store
                    .load_or_create(role)
                    .with_context(|| format!("could not prepare keys for '{role}'"))?;
                println!("{role}: {}", pair.public_key());
            }
        }
        Command::Generate { role } => {
            let pair = store
                .generate(&role)
                .with_context(|| format!("could not generate keys for '{role}'"))?;
            println!("{role}: {}", pair.public_key());
        }
        Command::Show { role } => {
            let key = store
                .import_peer_public_key(&role)
                .with_context(|| format!("no stored key for '{role}'"))?;
            println!("{key}");
        }
        Command::Authorize { name, role, key } => {
            let key = match (role, key) {
                (Some(role), None) => store
                    .import_peer_public_key(&role)
                    .with_context(|| format!("no stored key for '{role}'"))?,
                (None, Some(hex)) => PublicKey::from_hex(&hex)
                    .ok_or_else(|| anyhow!("'{hex}' is not a valid hex public key"))?,
                _ => return Err(anyhow!("pass exactly one of --role or --key")),
            };
            let path = store
                .authorize(&name, &key)
                .with_context(|| format!("could not authorize '{name}'"))?;
            println!("authorized {name} at {}", path.display());
        }
    }
    Ok(())
}
