use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use clap::Parser;
use raydium_pool_watch::{
    common::PoolEvent,
    config::AppConfig,
    output::{explorer_tx_link, render_table},
    resolver::{Resolver, RpcTransactionSource},
};
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{commitment_config::CommitmentConfig, signature::Signature};
use tokio::{fs, sync::mpsc};
use tracing::info;
use tracing_subscriber::{EnvFilter, Registry, fmt::Layer, layer::SubscriberExt};

/// Resolves pool creations of a single transaction, e.g. one that was dropped
/// as not found by the watcher.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, short)]
    config: PathBuf,

    /// Transaction signature, base58
    signature: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(env_filter).with(
        Layer::default()
            .with_writer(std::io::stdout)
            .with_ansi(false),
    );

    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let content = fs::read_to_string(&args.config).await?;
    let config = serde_json::from_str::<AppConfig>(&content)
        .map_err(|err| anyhow!("parse config json file error: {err}"))?;
    let signature = Signature::from_str(&args.signature)
        .map_err(|err| anyhow!("invalid signature {}: {err}", args.signature))?;

    let rpc_client = RpcClient::new_with_timeout_and_commitment(
        config.rpc_endpoint.to_string(),
        Duration::from_secs(config.rpc_timeout_secs),
        CommitmentConfig {
            commitment: config.commitment,
        },
    );
    let source = RpcTransactionSource::new(Arc::new(rpc_client), config.commitment);

    // events are printed below, the channel only satisfies the sink
    let (evt_tx, _evt_rx) = mpsc::unbounded_channel::<PoolEvent>();
    let resolver = Resolver::new(source, evt_tx, config.program_address);

    let evts = resolver
        .pool_events(signature)
        .await
        .map_err(|err| anyhow!("{} {err}", err.kind()))?;
    info!("{} pool creations in tx {signature}", evts.len());
    for evt in evts {
        println!("{}", render_table(&evt));
        println!("{}", explorer_tx_link(&config.output.explorer_tx_url, &evt));
        println!("{}", serde_json::to_string(&evt)?);
    }

    Ok(())
}
