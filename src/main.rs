use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlgate::config::{self, Config};
use sqlgate::engine::postgres::PgExecutor;
use sqlgate::engine::{ApprovalDetail, SystemClock};
use sqlgate::jobs::preview_sweep;
use sqlgate::middleware::auth::issue_token;
use sqlgate::middleware::rbac::{Identity, Role};
use sqlgate::models::{ApprovalStatus, NewDataSource};
use sqlgate::notification::webhook::WebhookNotifier;
use sqlgate::store::postgres::PgStore;
use sqlgate::store::{ApprovalStore, PreviewRecorder};
use sqlgate::{api, build_service, sql, AppState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sqlgate=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Approval { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_approval_command(&db, command).await
        }
        Some(cli::Commands::Datasource { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_datasource_command(&db, command).await
        }
        Some(cli::Commands::Token { command }) => handle_token_command(&cfg, command),
        Some(cli::Commands::Classify { sql }) => {
            classify_offline(&sql);
            Ok(())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    preview_sweep::recover_orphans(&db)
        .await
        .context("failed to recover orphaned previews")?;

    let executor = Arc::new(PgExecutor::new(
        db.clone(),
        cfg.pool_acquire_timeout,
        cfg.preview_ceiling,
    ));
    let notifier = Arc::new(WebhookNotifier::new(
        cfg.webhook_urls.clone(),
        cfg.webhook_secret.clone(),
    )?);
    let store = Arc::new(db);

    let service = build_service(
        &cfg,
        executor,
        store.clone(),
        store,
        notifier,
        Arc::new(SystemClock),
    );

    preview_sweep::spawn(service.previews().clone(), cfg.sweep_interval);
    tracing::info!(
        every_secs = cfg.sweep_interval.as_secs(),
        ceiling_secs = cfg.preview_ceiling.as_secs(),
        "preview sweep started"
    );

    let state = Arc::new(AppState {
        service,
        config: cfg,
    });
    let app = api::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("sqlgate listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_approval_command(db: &PgStore, cmd: cli::ApprovalCommands) -> anyhow::Result<()> {
    match cmd {
        cli::ApprovalCommands::List { status, limit } => {
            let status = status
                .map(|s| s.parse::<ApprovalStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let requests = db.list_requests(status, limit.clamp(1, 500), 0).await?;

            if requests.is_empty() {
                println!("No approval requests.");
                return Ok(());
            }

            println!("{:<38} {:<10} {:<12} {:<16} STATEMENT", "ID", "STATUS", "OPERATION", "SUBMITTED BY");
            for r in requests {
                println!(
                    "{:<38} {:<10} {:<12} {:<16} {}",
                    r.id,
                    r.status,
                    r.statement.operation,
                    r.statement.submitted_by,
                    sql::summarize(&r.statement.text, 60)
                );
            }
        }
        cli::ApprovalCommands::Show { request_id } => {
            let id = uuid::Uuid::parse_str(&request_id).context("Invalid request_id")?;
            let Some(request) = db.get_request(id).await? else {
                println!("Request {} not found.", id);
                return Ok(());
            };
            let detail = ApprovalDetail {
                reviews: db.list_reviews(id).await?,
                preview: db.latest(id).await?,
                request,
            };
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
    }
    Ok(())
}

async fn handle_datasource_command(
    db: &PgStore,
    cmd: cli::DatasourceCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::DatasourceCommands::Add {
            name,
            dsn,
            max_connections,
        } => {
            db.migrate().await?;
            let ds = db
                .create_data_source(&NewDataSource {
                    name,
                    dsn,
                    max_connections,
                })
                .await?;
            println!("Data source '{}' registered with id {}", ds.name, ds.id);
        }
        cli::DatasourceCommands::List => {
            let sources = db.list_data_sources().await?;
            if sources.is_empty() {
                println!("No data sources registered.");
                return Ok(());
            }
            println!("{:<38} {:<24} MAX CONNECTIONS", "ID", "NAME");
            for ds in sources {
                println!("{:<38} {:<24} {}", ds.id, ds.name, ds.max_connections);
            }
        }
    }
    Ok(())
}

fn handle_token_command(cfg: &Config, cmd: cli::TokenCommands) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Issue {
            user,
            role,
            scopes,
            ttl_hours,
        } => {
            let identity = Identity::new(user, Role::parse(&role), scopes);
            let token = issue_token(
                &cfg.jwt_secret,
                &identity,
                chrono::Duration::hours(ttl_hours.max(1)),
            )?;
            println!("{}", token);
        }
    }
    Ok(())
}

fn classify_offline(text: &str) {
    let kind = sql::classify(text);
    println!("operation:  {}", kind);
    println!("approval:   {}", if kind.requires_approval() { "required" } else { "not required" });
    match sql::validate(text, kind) {
        Ok(()) => println!("validation: ok"),
        Err(e) => println!("validation: {}", e),
    }
    if kind == sql::OperationKind::Delete {
        match sql::delete_to_select(text) {
            Ok(select) => println!("dry run:    {}", select),
            Err(e) => println!("dry run:    unavailable ({})", e),
        }
    }
}
