use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use apim_broker::api::{self, catalog::ParameterValidator, AppState, InstanceLocks};
use apim_broker::apim::{ApimClient, ApimEndpoints};
use apim_broker::client::Invoker;
use apim_broker::config::{self, Config, LogConfig};
use apim_broker::reconcile::Broker;
use apim_broker::store::{MemoryStore, PgStore, Store};
use apim_broker::token::TokenManager;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let result = dispatch(args).await;
    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Run a parsed command. Configuration is only loaded by commands that use it.
async fn dispatch(args: cli::Cli) -> anyhow::Result<()> {
    if let Some(cli::Commands::Catalog) = args.command {
        return print_catalog();
    }

    let cfg = config::load()?;
    init_tracing(&cfg.log);

    match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Migrate) => run_migrations(&cfg).await,
        Some(cli::Commands::Catalog) => print_catalog(),
        None => run_server(cfg, None).await,
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn print_catalog() -> anyhow::Result<()> {
    let catalog = serde_json::to_string_pretty(&api::catalog::catalog())?;
    println!("{}", catalog);
    Ok(())
}

async fn run_migrations(cfg: &Config) -> anyhow::Result<()> {
    let url = cfg
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to run migrations")?;
    let db = PgStore::connect(url).await?;
    db.migrate().await?;
    tracing::info!("Migrations applied");
    Ok(())
}

async fn run_server(cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    let invoker = Invoker::new(&cfg.client)?;
    let endpoints =
        ApimEndpoints::new(&cfg.apim).context("unable to construct API Manager endpoints")?;

    // Without a token no remote call can be authenticated, so this is fatal.
    tracing::info!("Generating access token...");
    let tokens = TokenManager::init(invoker.clone(), endpoints.token_settings(&cfg.apim))
        .await
        .context("unable to initialize the token manager")?;
    let apim = ApimClient::new(endpoints, invoker, Arc::new(tokens));

    let store: Arc<dyn Store> = match cfg.database_url.as_deref() {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(url).await?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            Arc::new(db)
        }
        None => {
            tracing::warn!("No database configured, records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = Arc::new(AppState {
        broker: Broker::new(apim, store),
        auth: cfg.server.auth.clone(),
        parameters: ParameterValidator::new()?,
        locks: InstanceLocks::default(),
    });
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, port.unwrap_or(cfg.server.port))
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("APIM service broker listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("unable to listen for SIGTERM: {}", e);
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
    tracing::info!("shutdown signal received");
}
