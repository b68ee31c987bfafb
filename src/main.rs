use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lifeline::alert::LogAlertSink;
use lifeline::config::AppConfig;
use lifeline::dispatch::{DispatchService, LocalChannelHub, SessionId};
use lifeline::error::{LifelineError, Result};
use lifeline::geo::GeoIndex;
use lifeline::ingest::LocationFeed;
use lifeline::outbox::{MessageBus, OutboxPublisher, RabbitMqBus};
use lifeline::store::{DispatchStore, PostgresStore};
use lifeline::RequestSubmission;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Topic the fleet reports positions on
const LOCATIONS_TOPIC: &str = "lifeline.locations";
/// Topic new emergencies arrive on
const SUBMISSIONS_TOPIC: &str = "lifeline.submissions";
/// Topic for provider and requester decisions
const COMMANDS_TOPIC: &str = "lifeline.commands";

const INTAKE_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "lifeline", about = "Emergency dispatch service", version)]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config: String,

    /// Skip database migrations on startup
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config error: {e}");
        }
        return Err(LifelineError::InvalidConfig(errors.join("; ")));
    }

    init_logging(&config);
    info!("Starting lifeline dispatch service");

    let store = PostgresStore::connect(&config.database).await?;
    if cli.skip_migrations {
        warn!("Skipping database migrations");
    } else {
        store.migrate().await?;
        info!("Database ready");
    }
    let store: Arc<dyn DispatchStore> = Arc::new(store);

    let bus = Arc::new(RabbitMqBus::connect(&config.bus).await?);
    for topic in [LOCATIONS_TOPIC, SUBMISSIONS_TOPIC, COMMANDS_TOPIC] {
        bus.ensure_topic(topic).await?;
    }

    let resolution = h3o::Resolution::try_from(config.geo.resolution)
        .map_err(|_| LifelineError::InvalidConfig(format!(
            "geo.resolution {} is not a valid H3 resolution",
            config.geo.resolution
        )))?;
    let geo = Arc::new(GeoIndex::new(resolution));
    let hub = Arc::new(LocalChannelHub::new());

    let service = Arc::new(DispatchService::new(
        geo.clone(),
        store.clone(),
        hub.clone(),
        config.dispatch.clone(),
    ));

    let publisher = Arc::new(OutboxPublisher::new(
        config.outbox.clone(),
        store.clone(),
        bus.clone(),
        Arc::new(LogAlertSink),
        config.bus.topic_prefix.clone(),
    ));
    let publisher_handle = publisher.start();

    // Location feed: bus -> channel -> geo index
    let (location_tx, location_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(1024);
    let feed_handle = tokio::spawn(LocationFeed::new(geo.clone()).run(location_rx));
    let location_pump = {
        let bus = bus.clone();
        tokio::spawn(async move {
            loop {
                match bus.receive(LOCATIONS_TOPIC).await {
                    Ok(Some(raw)) => {
                        if location_tx.send(raw).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => tokio::time::sleep(INTAKE_POLL).await,
                    Err(e) => {
                        error!("Location intake error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    // Submission and command intake
    let intake_handle = {
        let bus = bus.clone();
        let service = service.clone();
        tokio::spawn(async move {
            loop {
                let mut idle = true;

                match bus.receive(SUBMISSIONS_TOPIC).await {
                    Ok(Some(raw)) => {
                        idle = false;
                        match serde_json::from_slice::<RequestSubmission>(&raw) {
                            Ok(submission) => {
                                if let Err(e) = service.submit(submission).await {
                                    error!("Submission rejected: {}", e);
                                }
                            }
                            Err(e) => warn!("Dropping malformed submission: {}", e),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("Submission intake error: {}", e),
                }

                match bus.receive(COMMANDS_TOPIC).await {
                    Ok(Some(raw)) => {
                        idle = false;
                        match serde_json::from_slice(&raw) {
                            Ok(message) => {
                                // Decisions carry the actor id themselves
                                let session = SessionId(uuid::Uuid::nil());
                                if let Err(e) = service.handle_message(session, message).await {
                                    warn!("Command rejected: {}", e);
                                }
                            }
                            Err(e) => warn!("Dropping malformed command: {}", e),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("Command intake error: {}", e),
                }

                if idle {
                    tokio::time::sleep(INTAKE_POLL).await;
                }
            }
        })
    };

    info!(
        "Dispatch service running (resolution {}, top_k {}, offer timeout {}s)",
        config.geo.resolution, config.dispatch.top_k, config.dispatch.offer_timeout_secs
    );

    shutdown_signal().await;
    info!("Shutting down");

    publisher.stop();
    intake_handle.abort();
    location_pump.abort();
    feed_handle.abort();
    let _ = publisher_handle.await;
    bus.close().await?;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
