//! Gatehouse - admission control and governance for crowdsourced reports

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::{
    config::{Args, LogFormat},
    db::MongoClient,
    queue::{AnalysisQueue, MemoryQueue, NatsClient, NatsQueue},
    server,
    store::{MemoryStore, MongoStore, Store},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gatehouse={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Gatehouse - report admission control");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MongoDB: {} / {}", args.mongodb_uri, args.mongodb_db);
    info!(
        "NATS: {} ({})",
        args.nats.nats_url,
        if args.nats.nats_jetstream { "jetstream" } else { "core" }
    );
    info!("Key environment: {}", args.fetcher_key_env);
    info!(
        "Default caps: {}/min, {}/day (charge: {:?})",
        args.default_per_minute_cap, args.default_daily_cap, args.quota_charge
    );
    info!("======================================");

    // Connect to MongoDB (memory store fallback in dev mode)
    let store: Arc<dyn Store> = match connect_mongo(&args).await {
        Ok(store) => {
            info!("MongoDB connected successfully");
            Arc::new(store)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, using memory store): {}", e);
                Arc::new(MemoryStore::new())
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    // Connect to NATS (memory queue fallback in dev mode)
    let queue: Arc<dyn AnalysisQueue> = match NatsClient::new(&args.nats, "gatehouse").await {
        Ok(client) => {
            info!("NATS connected successfully");
            Arc::new(NatsQueue::new(client, &args.nats))
        }
        Err(e) => {
            if args.dev_mode {
                warn!("NATS connection failed (dev mode, using memory queue): {}", e);
                Arc::new(MemoryQueue::new())
            } else {
                error!("NATS connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let state = Arc::new(server::AppState::new(args, store, queue));

    // Run the server
    if let Err(e) = server::run(state).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn connect_mongo(args: &Args) -> gatehouse::Result<MongoStore> {
    let client = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    MongoStore::new(client).await
}
