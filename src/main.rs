use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use peertls::{Address, Ed25519Suite, ServerIdentity, Suite};

#[derive(Parser, Debug)]
#[command(name = "peertls")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh Ed25519 secret and public key as hex.
    Keygen,

    /// Accept authenticated connections and echo every packet back.
    Listen {
        #[arg(short, long, default_value = "127.0.0.1:7770")]
        bind: String,

        /// Hex-encoded 32-byte secret key; a fresh one is generated if omitted.
        #[arg(short, long)]
        secret: Option<String>,
    },

    /// Connect to a listener, send one packet and print the reply.
    Connect {
        /// Listener address, e.g. tls://127.0.0.1:7770
        #[arg(short, long)]
        to: Address,

        /// Hex-encoded public key the listener must prove.
        #[arg(short, long)]
        peer: String,

        #[arg(short, long)]
        secret: Option<String>,

        #[arg(short, long, default_value = "hello")]
        message: String,
    },
}

fn parse_secret(secret: Option<&str>) -> Result<SigningKey> {
    let Some(hex_secret) = secret else {
        return Ok(Ed25519Suite.generate_secret());
    };
    let bytes: [u8; 32] = hex::decode(hex_secret)
        .context("invalid hex secret key")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret key must be 64 hex characters (32 bytes)"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn parse_public(public: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(public).context("invalid hex public key")?;
    Ed25519Suite
        .unmarshal_point(&bytes)
        .context("not an Ed25519 public key")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let suite = Arc::new(Ed25519Suite);

    match args.command {
        Command::Keygen => {
            let secret = suite.generate_secret();
            println!("secret: {}", hex::encode(secret.to_bytes()));
            println!("public: {}", hex::encode(secret.verifying_key().to_bytes()));
        }
        Command::Listen { bind, secret } => {
            let secret = parse_secret(secret.as_deref())?;
            let address: Address = format!("tls://{bind}").parse()?;
            let us = Arc::new(ServerIdentity::with_private(&*suite, secret, address));
            info!("Node public key: {}", hex::encode(us.public().to_bytes()));

            let listener = peertls::listen(&us, &suite, &bind).await?;
            info!("Listening on {}", listener.local_addr());

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to wait for shutdown signal");
                }
                info!("Received shutdown signal, exiting gracefully");
            };

            listener
                .serve(
                    |mut conn| async move {
                        let peer = hex::encode(conn.peer_public().to_bytes());
                        info!(%peer, remote = %conn.remote_addr(), "peer connected");
                        loop {
                            match conn.receive().await {
                                Ok(packet) => {
                                    if let Err(e) = conn.send(&packet).await {
                                        warn!(%peer, error = %e, "echo failed");
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                        info!(%peer, tx = conn.tx(), rx = conn.rx(), "peer disconnected");
                    },
                    shutdown,
                )
                .await?;
        }
        Command::Connect {
            to,
            peer,
            secret,
            message,
        } => {
            let secret = parse_secret(secret.as_deref())?;
            let local: Address = "tls://0.0.0.0:0".parse()?;
            let us = Arc::new(ServerIdentity::with_private(&*suite, secret, local));
            let them = ServerIdentity::new(parse_public(&peer)?, to);

            let mut conn = peertls::connect(&us, &them, &suite)
                .await
                .context("connect failed")?;
            conn.send(message.as_bytes()).await?;
            let reply = conn.receive().await?;
            println!("{}", String::from_utf8_lossy(&reply));
            conn.close().await?;
        }
    }

    Ok(())
}
