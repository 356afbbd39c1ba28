use clap::{Parser, ValueEnum};
use ledger_service::{build_router, LedgerBackendConfig, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LedgerStorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "ledgerd", version, about = "Ledger core REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8091
    #[arg(long, default_value = "127.0.0.1:8091")]
    listen: SocketAddr,
    /// Ledger persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = LedgerStorageMode::Auto, env = "LEDGER_STORAGE")]
    ledger_storage: LedgerStorageMode,
    /// PostgreSQL url for ledger persistence.
    #[arg(long, env = "LEDGER_DATABASE_URL")]
    ledger_database_url: Option<String>,
    /// Max PostgreSQL pool connections for ledger persistence.
    #[arg(long, default_value_t = 5, env = "LEDGER_PG_MAX_CONNECTIONS")]
    ledger_pg_max_connections: u32,
}

fn resolve_ledger_storage(cli: &Cli) -> anyhow::Result<LedgerBackendConfig> {
    let resolved_url = cli
        .ledger_database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let backend = match cli.ledger_storage {
        LedgerStorageMode::Memory => LedgerBackendConfig::Memory,
        LedgerStorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("ledger_storage=postgres requires --ledger-database-url or DATABASE_URL")
            })?;
            LedgerBackendConfig::Postgres {
                database_url,
                max_connections: cli.ledger_pg_max_connections,
            }
        }
        LedgerStorageMode::Auto => match resolved_url {
            Some(database_url) => LedgerBackendConfig::Postgres {
                database_url,
                max_connections: cli.ledger_pg_max_connections,
            },
            None => LedgerBackendConfig::Memory,
        },
    };

    Ok(backend)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ledger_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let backend = resolve_ledger_storage(&cli)?;
    let state = ServiceState::bootstrap(ServiceConfig { backend }).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("ledger-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
