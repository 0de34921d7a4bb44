use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lapin::{Connection, ConnectionProperties};
use tokio::signal;
use tracing::info;

use bitmex_relay::account::AccountManager;
use bitmex_relay::config::Config;
use bitmex_relay::bus::EventBus;
use bitmex_relay::error::Result;
use bitmex_relay::exchange::{BitmexConnector, ConnectExchange};
use bitmex_relay::orchestrator::OrderExecutor;
use bitmex_relay::queues::{AccountQueueManager, OrderQueueManager, PositionQueueManager};
use bitmex_relay::server;
use bitmex_relay::store::{self, DataStore, RedisStore};
use bitmex_relay::stream::StreamRouter;

#[derive(Parser)]
#[command(name = "bitmex-relay", about = "AMQP to BitMEX bridge node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node.
    Start {
        #[arg(long)]
        host: Option<String>,
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let Command::Start { host, port } = cli.command;

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    config.init_logging();
    info!("bitmex-relay starting");

    run(config).await.context("fatal error")?;

    info!("bitmex-relay stopped");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let bus = Arc::new(EventBus::new());

    let data_store: Arc<dyn DataStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    store::register_listeners(&bus, Arc::clone(&data_store));

    let recv_connection =
        Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;
    let send_connection =
        Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;

    let router = StreamRouter::new(Arc::clone(&bus));
    let connector: Arc<dyn ConnectExchange> = Arc::new(BitmexConnector::default());
    let accounts = AccountManager::new(
        Arc::clone(&bus),
        connector,
        Arc::clone(&router),
        config.sandbox(),
    );
    accounts.register_listeners();

    let executor = OrderExecutor::new(
        Arc::clone(&bus),
        Arc::clone(&data_store),
        Arc::clone(&accounts),
    );
    executor.register_listeners();

    let account_queues = AccountQueueManager::start(
        Arc::clone(&bus),
        Arc::clone(&accounts),
        &recv_connection,
        &send_connection,
        &config.bitmex_exchange,
    )
    .await?;
    let order_queues = OrderQueueManager::start(
        Arc::clone(&bus),
        &recv_connection,
        &send_connection,
        &config.bitmex_exchange,
    )
    .await?;
    let position_queues = PositionQueueManager::start(
        Arc::clone(&bus),
        &recv_connection,
        &send_connection,
        &config.bitmex_exchange,
    )
    .await?;

    info!(
        exchange = %config.bitmex_exchange,
        sandbox = config.sandbox(),
        "bitmex-relay ready"
    );

    tokio::select! {
        result = server::serve(&config.host, config.port) => result?,
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Teardown order mirrors startup: broker consumers first, then the
    // exchange session.
    account_queues.stop().await?;
    order_queues.stop().await?;
    position_queues.stop().await?;
    accounts.disconnect().await;

    Ok(())
}
