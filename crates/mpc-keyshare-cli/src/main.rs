//! MPC Key-Share CLI
//!
//! Command-line harness for the key-share subsystem, running the loopback
//! engine against an in-process cosigner.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mpc_keyshare_core::{
    derive_address,
    engine::{
        loopback::{verify_signature, PROTOCOL_ROUNDS},
        LoopbackCosigner, LoopbackEngine,
    },
    keccak256_hash,
    storage::{FileSecureStorage, KeyShareStore, StoreConfig},
    Algorithm, MpcWallet, SessionKind, WalletConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mpc-keyshare")]
#[command(about = "MPC key-share CLI", version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate, sign, verify, rotate and delete a wallet with a loopback cosigner
    Demo {
        /// Store directory; a temporary one is used when omitted
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Profile to create the wallet for
        #[arg(short, long, default_value = "demo")]
        profile: String,

        /// Message to sign
        #[arg(short, long, default_value = "hello from mpc-keyshare")]
        message: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Keep the wallet in the store instead of deleting it at the end
        #[arg(short, long)]
        keep: bool,
    },

    /// Print the stored metadata of a profile
    Inspect {
        /// Store directory
        #[arg(short, long)]
        dir: PathBuf,

        /// Profile to inspect
        #[arg(short, long)]
        profile: String,

        /// Record namespace of the store
        #[arg(short, long, default_value = "mpc.wallet")]
        namespace: String,
    },

    /// Derive the address of a hex-encoded public key
    DeriveAddress {
        /// Public key, with or without 0x prefix
        public_key: String,
    },

    /// Show version information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .pretty()
        .init();

    match cli.command {
        Commands::Demo {
            dir,
            profile,
            message,
            format,
            keep,
        } => match dir {
            Some(dir) => run_demo(&dir, &profile, &message, &format, keep).await?,
            None => {
                if keep {
                    warn!("--keep without --dir: the temporary store is removed on exit");
                }
                let tmp = tempfile::tempdir().context("create temporary store directory")?;
                run_demo(tmp.path(), &profile, &message, &format, keep).await?;
            }
        },
        Commands::Inspect {
            dir,
            profile,
            namespace,
        } => {
            inspect(&dir, &profile, &namespace).await?;
        }
        Commands::DeriveAddress { public_key } => {
            println!("{}", derive_address(&public_key)?);
        }
        Commands::Info => {
            println!("MPC Key-Share v{}", mpc_keyshare_core::VERSION);
            println!();
            println!("Algorithms: {} (loopback engine)", Algorithm::Ecdsa);
            println!("Rounds (loopback engine uses {PROTOCOL_ROUNDS} each):");
            for kind in [
                SessionKind::KeyGeneration,
                SessionKind::KeyRotation,
                SessionKind::Signing,
            ] {
                println!("  {kind}: at most {}", kind.max_rounds());
            }
        }
    }

    Ok(())
}

async fn run_demo(dir: &Path, profile: &str, message: &str, format: &str, keep: bool) -> Result<()> {
    info!(dir = %dir.display(), "Running loopback demo");

    let cosigner = Arc::new(LoopbackCosigner::new());
    let config = WalletConfig::new(cosigner.public_key_hex());
    let storage = Arc::new(FileSecureStorage::new(dir)?);
    let wallet = MpcWallet::from_config(
        &config,
        Arc::new(LoopbackEngine::new()),
        cosigner.clone(),
        storage,
    )?;

    // The in-process cosigner forgets its shares between runs
    if wallet.has_wallet(profile).await? {
        warn!(profile, "Removing wallet left by a previous run");
        wallet.delete_wallet(profile).await?;
    }

    let share = wallet.generate_wallet(Algorithm::Ecdsa, profile).await?;
    let scheme = wallet.store().encryption_scheme().await?;

    let digest = keccak256_hash(message.as_bytes());
    let signature = wallet
        .sign_message(profile, Algorithm::Ecdsa, message.as_bytes())
        .await?;
    if !verify_signature(&share.public_key_bytes()?, &digest, &signature.bytes) {
        bail!("signature does not verify under the joint public key");
    }

    let rotated = wallet.rotate_wallet(profile).await?;
    if rotated.address != share.address {
        bail!("rotation changed the wallet address");
    }
    let rotated_signature = wallet
        .sign_message(profile, Algorithm::Ecdsa, message.as_bytes())
        .await?;
    if !verify_signature(&share.public_key_bytes()?, &digest, &rotated_signature.bytes) {
        bail!("signature from the rotated share does not verify under the joint public key");
    }
    let metadata = wallet.wallet_metadata(profile).await?;

    let deleted = if keep {
        info!(profile, dir = %dir.display(), "Keeping wallet in store");
        false
    } else {
        wallet.delete_wallet(profile).await?;
        !wallet.has_wallet(profile).await?
    };

    if format == "json" {
        let output = serde_json::json!({
            "profile": profile,
            "encryption_scheme": scheme.to_string(),
            "key_id": share.key_id.to_string(),
            "public_key": share.public_key,
            "address": share.address,
            "message_digest": format!("0x{}", hex::encode(digest)),
            "signature": signature.to_hex(),
            "rotated": {
                "key_id": rotated.key_id.to_string(),
                "address": rotated.address,
                "signature": rotated_signature.to_hex(),
                "metadata": metadata,
            },
            "deleted": deleted,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\nWallet created for profile {profile}");
    println!("  Key ID:     {}", share.key_id);
    println!("  Public Key: 0x{}", share.public_key);
    println!("  Address:    {}", share.address);
    println!("  Encryption: {scheme}");
    println!("\nSigned {message:?}");
    println!("  Digest:    0x{}", hex::encode(digest));
    println!("  Signature: {}", signature.to_hex());
    println!("  [VERIFIED]");
    println!("\nRotated key share (address unchanged)");
    println!("  Key ID:  {}", rotated.key_id);
    println!("  Address: {}", rotated.address);
    if let Some(rotated_at) = metadata.and_then(|m| m.last_rotated) {
        println!("  Rotated: {rotated_at}");
    }
    println!("  [VERIFIED]");
    if keep {
        println!("\nWallet kept in {}", dir.display());
    } else {
        println!("\nWallet deleted: {deleted}");
    }

    Ok(())
}

async fn inspect(dir: &Path, profile: &str, namespace: &str) -> Result<()> {
    if !dir.is_dir() {
        bail!("store directory {} does not exist", dir.display());
    }

    let store = KeyShareStore::new(Arc::new(FileSecureStorage::new(dir)?))
        .with_config(StoreConfig::default().with_namespace(namespace));

    match store.metadata(profile).await? {
        Some(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
        None => println!("No wallet stored for profile {profile}"),
    }

    Ok(())
}
