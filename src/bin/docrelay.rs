//! docrelay - HTTP ingestion relayed through a durable queue into a document store
//!
//! `docrelay serve` runs the gateway and the relay worker in one process,
//! `docrelay worker` runs only the worker and `docrelay send` publishes a single
//! message from the command line.

use clap::{Parser, Subcommand};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use docrelay::gateway::{self, AppState};
use docrelay::{
    Broker, DocumentStore, MemoryBroker, MemoryStore, NatsBroker, Payload, RelayConfig, RelayWorker,
};

#[derive(Parser)]
#[command(name = "docrelay")]
#[command(version, about = "Relay HTTP payloads through a durable queue into a document store", long_about = None)]
struct Cli {
    /// Use in-process broker and store instead of NATS and PostgreSQL
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway and the relay worker (default)
    Serve {
        /// Override the PORT environment variable
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run only the relay worker
    Worker,

    /// Publish one message built from the given words
    Send {
        /// Words joined with spaces into the message text
        #[arg(required = true)]
        words: Vec<String>,

        /// Payload field to carry the message
        #[arg(short, long, default_value = "text")]
        field: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            let (broker, store) = connect(&config, cli.memory).await?;
            serve(config, broker, store).await
        }
        Commands::Worker => {
            let (broker, store) = connect(&config, cli.memory).await?;
            let worker =
                RelayWorker::new(broker, store, &config.broker.queue, config.worker.clone()).spawn();

            shutdown_signal().await;
            worker.shutdown().await;
            Ok(())
        }
        Commands::Send { words, field } => {
            let broker = connect_broker(&config, cli.memory).await?;
            broker.declare_queue(&config.broker.queue).await?;

            let message = words.join(" ");
            let payload = Payload::new().with(field, message.as_str());
            broker.publish(&config.broker.queue, payload.encode()?).await?;

            println!("[x] Sent {}", message);
            Ok(())
        }
    }
}

async fn serve(
    config: RelayConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn DocumentStore>,
) -> Result<(), Box<dyn Error>> {
    let queue = config.broker.queue.clone();
    broker.declare_queue(&queue).await?;

    // The worker gets its own task so its consume loop never competes with request handling
    let worker = RelayWorker::new(broker.clone(), store.clone(), &queue, config.worker.clone()).spawn();

    let state = Arc::new(
        AppState::new(broker, store, &queue).with_text_analysis(config.worker.analyze_text),
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%queue, "Publishing to queue");

    let served = gateway::serve(listener, state, shutdown_signal()).await;

    worker.shutdown().await;
    served?;
    Ok(())
}

async fn connect(
    config: &RelayConfig,
    memory: bool,
) -> Result<(Arc<dyn Broker>, Arc<dyn DocumentStore>), Box<dyn Error>> {
    let broker = connect_broker(config, memory).await?;
    let store = connect_store(config, memory).await?;
    Ok((broker, store))
}

async fn connect_broker(config: &RelayConfig, memory: bool) -> Result<Arc<dyn Broker>, Box<dyn Error>> {
    if memory {
        tracing::warn!("Using in-memory broker; queued messages do not survive a restart");
        return Ok(Arc::new(MemoryBroker::new()));
    }
    Ok(Arc::new(NatsBroker::connect(&config.broker).await?))
}

#[cfg(feature = "postgres")]
async fn connect_store(config: &RelayConfig, memory: bool) -> Result<Arc<dyn DocumentStore>, Box<dyn Error>> {
    if memory {
        tracing::warn!("Using in-memory document store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(docrelay::PostgresStore::connect(&config.store).await?))
}

#[cfg(not(feature = "postgres"))]
async fn connect_store(_config: &RelayConfig, memory: bool) -> Result<Arc<dyn DocumentStore>, Box<dyn Error>> {
    if !memory {
        return Err("built without a database backend; rerun with --memory".into());
    }
    Ok(Arc::new(MemoryStore::new()))
}

/// Resolves on ctrl-c, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
