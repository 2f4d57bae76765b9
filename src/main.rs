//! Webrelay CLI - manage the trusted session of this machine

use std::time::Instant;

use clap::Parser;
use tracing::{error, info};

use webrelay::{
    config::{parse_key, Args, Command},
    keystore::{crypto, TrustedKeyStore},
    logging, storage,
    transport::KeyPair,
    RelayError,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init(&args.log_level, args.log_json);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let storage = storage::open_persistent(&args.storage_path);
    let keystore = TrustedKeyStore::new(storage, args.kdf_settings());
    if keystore.storage_blocked() {
        println!("warning: storage unavailable, running memory-only");
    }

    match &args.command {
        Command::Status => {
            if keystore.has_trusted_key() {
                println!(
                    "trusted session stored ({})",
                    if keystore.is_auto_session() { "auto" } else { "manual" }
                );
            } else {
                println!("no trusted session");
            }
        }

        Command::Unlock { password } => match keystore.retrieve_trusted_key(password).await {
            Ok(Some(data)) => {
                let key_pair = KeyPair::from_secret_bytes(*data.own_secret_key);
                println!("public key: {}", key_pair.public_key_hex());
                println!("peer key:   {}", hex::encode(data.peer_public_key));
                match data.push_token {
                    Some(token) => println!("push:       {}", token.kind),
                    None => println!("push:       none"),
                }
            }
            Ok(None) => println!("no trusted session"),
            Err(RelayError::DecryptionFailed) => {
                error!("Wrong password or corrupted record");
                std::process::exit(2);
            }
            Err(e) => return Err(e.into()),
        },

        Command::Forget => {
            keystore.clear();
            info!("Trusted session deleted");
            println!("trusted session deleted");
        }

        Command::Bench => {
            let target = args.kdf_settings().target;
            let started = Instant::now();
            let work = crypto::benchmark_work_factor(target).await?;
            println!(
                "N = 2^{} ({}), r = {}, p = {} for a {:?} target (benchmark took {:?})",
                work.log_n,
                work.n(),
                work.r,
                work.p,
                target,
                started.elapsed()
            );
        }

        Command::Host { public_key } => {
            let key = parse_key(public_key)?;
            println!("{}", args.signaling_config()?.resolve_host(&key));
        }
    }

    Ok(())
}
