use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use raydium_pool_watch::{
    config::{AppConfig, Transport},
    dispatcher::Dispatcher,
    output::{OutputRecord, PoolEventWriter, Sink},
    resolver::{Resolver, RpcTransactionSource, TransactionSource},
    stream::{PubsubLogsChannel, SubscriptionChannel, WsLogsChannel},
};
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use tokio::{fs, sync::mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, fmt::Layer, layer::SubscriberExt};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[arg(long, short)]
    pub config: PathBuf,

    /// Overrides the transport of the config file
    #[arg(long, value_enum)]
    pub transport: Option<Transport>,
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

    let cli = Cli::parse();
    let content = fs::read_to_string(cli.config).await?;
    let mut config = serde_json::from_str::<AppConfig>(&content)
        .map_err(|err| anyhow!("parse config json file error: {err}"))?;
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }

    let rpc_client = RpcClient::new_with_timeout_and_commitment(
        config.rpc_endpoint.to_string(),
        Duration::from_secs(config.rpc_timeout_secs),
        CommitmentConfig {
            commitment: config.commitment,
        },
    );
    let source = RpcTransactionSource::new(Arc::new(rpc_client), config.commitment)
        .keep_raw(config.output.raw_transactions_path.is_some());

    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<OutputRecord>();
    let writer = PoolEventWriter::open(&config.output).await?;
    let writer_task = tokio::spawn(writer.run(evt_rx));

    let resolver = Resolver::new(source, evt_tx, config.program_address);
    let mut dispatcher = Dispatcher::new(
        resolver,
        config.instruction_marker.clone(),
        config.dedup_capacity,
    );

    info!(
        "monitoring logs of program {} for `{}`, transport: {:?}, commitment: {:?}",
        config.program_address, config.instruction_marker, config.transport, config.commitment
    );
    let result = tokio::select! {
        result = watch_transport(&mut dispatcher, &config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            Ok(())
        }
    };

    dispatcher.drain().await;
    drop(dispatcher);
    writer_task.await?;

    result
}

async fn watch_transport<S, K>(dispatcher: &mut Dispatcher<S, K>, config: &AppConfig) -> Result<()>
where
    S: TransactionSource,
    K: Sink,
{
    match config.transport {
        Transport::Websocket => {
            let channel = WsLogsChannel::new(config.stream_endpoint.clone());
            watch(&channel, dispatcher, config).await
        }
        Transport::Pubsub => {
            let channel = PubsubLogsChannel::new(config.stream_endpoint.clone());
            watch(&channel, dispatcher, config).await
        }
    }
}

/// Keeps a subscription open, reopening it after transport failures. Gives up
/// after `max_open_failures` consecutive failed opens.
async fn watch<C, S, K>(
    channel: &C,
    dispatcher: &mut Dispatcher<S, K>,
    config: &AppConfig,
) -> Result<()>
where
    C: SubscriptionChannel,
    S: TransactionSource,
    K: Sink,
{
    let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);
    let mut open_failures = 0;

    loop {
        match channel
            .open(config.program_address, config.commitment)
            .await
        {
            Ok(subscription) => {
                open_failures = 0;
                info!("subscription opened, id: {:?}", subscription.id);
                let err = dispatcher.run(subscription).await;
                warn!(kind = err.kind(), "subscription lost: {err}");
            }
            Err(err) => {
                open_failures += 1;
                error!(
                    kind = err.kind(),
                    "open subscription failed ({open_failures}/{}): {err}",
                    config.max_open_failures
                );
                if open_failures >= config.max_open_failures {
                    bail!("giving up after {open_failures} failed subscription attempts: {err}");
                }
            }
        }

        tokio::time::sleep(reconnect_delay).await;
    }
}
