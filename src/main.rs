use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fedgate::schema_registry::SchemaRegistry;
use fedgate::{
    FederatedQueryPlanner, FederationGateway, GatewayConfig, HttpQueryExecutor,
    InMemorySchemaRegistry, SchemaPoller, SubscriptionBridge, server,
};

/// Federated GraphQL gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the gateway configuration file.
    #[arg(long, env = "FEDGATE_CONFIG", default_value = "gateway.yaml")]
    config: PathBuf,

    /// Address to listen on, overriding the configuration file.
    #[arg(long, env = "FEDGATE_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "gateway failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_file(&args.config)?;
    let listen = args.listen.unwrap_or(config.listen);
    let client = config.http_client()?;

    let registry: Arc<dyn SchemaRegistry> =
        Arc::new(InMemorySchemaRegistry::new(config.services()));
    tracing::info!(
        config = %args.config.display(),
        subgraphs = config.subgraphs.len(),
        "configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let poller = SchemaPoller::new(Arc::clone(&registry), client.clone(), config.poll_interval)
        .spawn(shutdown.clone());

    let gateway = Arc::new(FederationGateway::new(
        registry,
        Box::new(FederatedQueryPlanner::new()),
        Box::new(HttpQueryExecutor::with_client(client)),
        SubscriptionBridge::new(config.subscription_buffer),
    ));

    let listener = TcpListener::bind(listen).await?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "cannot listen for ctrl-c");
            return;
        }
        tracing::info!("received ctrl-c");
        signal.cancel();
    });

    server::serve(listener, gateway, shutdown).await?;
    let _ = poller.await;
    Ok(())
}
