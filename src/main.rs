use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledger_exchange::config::AppConfig;
use ledger_exchange::dispatcher::RequestDispatcher;
use ledger_exchange::matching::MatchEngine;
use ledger_exchange::server;
use ledger_exchange::store::{PostgresStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ledger_exchange=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load()?;
    tracing::info!(environment = %config.environment, "starting up");

    let store = PostgresStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    let store: Arc<dyn Store> = Arc::new(store);

    let engine = Arc::new(
        MatchEngine::new(
            store.clone(),
            config.room_pool_limit,
            config.side_book_max_size,
            config.side_book_min_size,
        )
        .await?,
    );
    let dispatcher = Arc::new(RequestDispatcher::new(engine, store));

    let listener = server::bind(&config.bind_addr()).await?;

    tokio::select! {
        result = server::run(listener, dispatcher) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server loop exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}
